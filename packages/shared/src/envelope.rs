//! Typed wire envelopes.
//!
//! Every frame exchanged over the connection is one JSON object tagged by a
//! `type` field. Each variant carries only the fields its type requires, so a
//! frame missing a required field fails at decode time instead of deep inside
//! a handler. Tags the build does not recognize decode to [`Envelope::Unknown`]
//! and are dropped without effect, so older builds keep working against newer
//! peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{RoomId, UserId};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Online/offline presence status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A single typed message unit exchanged over the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame a client sends after the transport opens.
    Authenticate { user_id: UserId },
    /// Server's acceptance of `authenticate`; the connection is live.
    Authenticated {
        user_id: UserId,
        connection_id: String,
    },
    /// Sent by the server immediately after the upgrade, before auth.
    ConnectionAck { connection_id: String },
    /// Liveness probe. `ping` is accepted as a legacy alias.
    #[serde(alias = "ping")]
    Heartbeat { timestamp: i64 },
    /// Probe acknowledgement. `pong` is accepted as a legacy alias.
    #[serde(alias = "pong")]
    HeartbeatAck { timestamp: i64 },
    JoinRoom { room_id: RoomId },
    /// Returned to the joiner with the membership at join time.
    RoomJoined {
        room_id: RoomId,
        members: Vec<UserId>,
    },
    LeaveRoom { room_id: RoomId },
    UserJoinedRoom {
        room_id: RoomId,
        user_id: UserId,
        timestamp: i64,
    },
    UserLeftRoom {
        room_id: RoomId,
        user_id: UserId,
        timestamp: i64,
    },
    /// Client-originated chat message, addressed to a room or a single user.
    SendMessage {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        content: String,
        message_id: String,
        timestamp: i64,
    },
    /// Server fan-out of a chat message to its audience.
    NewMessage {
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        content: String,
        message_id: String,
        timestamp: i64,
    },
    /// Ack to the sender that the server accepted the message.
    MessageSent { message_id: String, timestamp: i64 },
    /// Sent to the sender when the recipient had a live connection.
    MessageDelivered {
        message_id: String,
        recipient_id: UserId,
    },
    /// Reader marks a message as read; routed to the original sender.
    MarkRead {
        reader_id: UserId,
        sender_id: UserId,
        message_id: String,
    },
    MessageRead {
        reader_id: UserId,
        message_id: String,
        timestamp: i64,
    },
    Typing { room_id: RoomId, user_id: UserId },
    UserTyping { room_id: RoomId, user_id: UserId },
    StopTyping { room_id: RoomId, user_id: UserId },
    UserStoppedTyping { room_id: RoomId, user_id: UserId },
    UserStatusChange {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: i64,
    },
    Error { code: String, message: String },
    /// Catch-all for tags this build does not recognize. Accepted, never acted
    /// on.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Parse a JSON frame into an envelope.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        serde_json::from_str(raw).map_err(CodecError::Decode)
    }

    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Authenticate { .. } => "authenticate",
            Envelope::Authenticated { .. } => "authenticated",
            Envelope::ConnectionAck { .. } => "connection_ack",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::HeartbeatAck { .. } => "heartbeat_ack",
            Envelope::JoinRoom { .. } => "join_room",
            Envelope::RoomJoined { .. } => "room_joined",
            Envelope::LeaveRoom { .. } => "leave_room",
            Envelope::UserJoinedRoom { .. } => "user_joined_room",
            Envelope::UserLeftRoom { .. } => "user_left_room",
            Envelope::SendMessage { .. } => "send_message",
            Envelope::NewMessage { .. } => "new_message",
            Envelope::MessageSent { .. } => "message_sent",
            Envelope::MessageDelivered { .. } => "message_delivered",
            Envelope::MarkRead { .. } => "mark_read",
            Envelope::MessageRead { .. } => "message_read",
            Envelope::Typing { .. } => "typing",
            Envelope::UserTyping { .. } => "user_typing",
            Envelope::StopTyping { .. } => "stop_typing",
            Envelope::UserStoppedTyping { .. } => "user_stopped_typing",
            Envelope::UserStatusChange { .. } => "user_status_change",
            Envelope::Error { .. } => "error",
            Envelope::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    #[test]
    fn test_decode_authenticate() {
        // テスト項目: authenticate フレームが正しくデコードされる
        // given (前提条件):
        let raw = r#"{"type":"authenticate","user_id":"42"}"#;

        // when (操作):
        let envelope = Envelope::decode(raw).unwrap();

        // then (期待する結果):
        assert_eq!(envelope, Envelope::Authenticate { user_id: user("42") });
    }

    #[test]
    fn test_send_message_round_trip() {
        // テスト項目: send_message がエンコード・デコードで同じ値になる
        // given (前提条件):
        let envelope = Envelope::SendMessage {
            sender_id: user("42"),
            recipient_id: Some(user("99")),
            room_id: None,
            content: "hi".to_string(),
            message_id: "m-1".to_string(),
            timestamp: 1_700_000_000_000,
        };

        // when (操作):
        let raw = envelope.encode().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();

        // then (期待する結果):
        assert_eq!(decoded, envelope);
        // room_id は省略される
        assert!(!raw.contains("room_id"));
    }

    #[test]
    fn test_decode_unknown_type_is_accepted() {
        // テスト項目: 未知の type タグは Unknown として受理される
        // given (前提条件):
        let raw = r#"{"type":"payment_completed","amount":120}"#;

        // when (操作):
        let envelope = Envelope::decode(raw).unwrap();

        // then (期待する結果):
        assert_eq!(envelope, Envelope::Unknown);
    }

    #[test]
    fn test_decode_missing_required_field_fails() {
        // テスト項目: 必須フィールドが欠けたフレームはデコードに失敗する
        // given (前提条件): content のない send_message
        let raw = r#"{"type":"send_message","sender_id":"42","message_id":"m-1","timestamp":0}"#;

        // when (操作):
        let result = Envelope::decode(raw);

        // then (期待する結果):
        assert!(result.is_err());
    }

    #[test]
    fn test_heartbeat_aliases() {
        // テスト項目: ping / pong が heartbeat / heartbeat_ack の別名として扱われる
        // given (前提条件):
        let ping = r#"{"type":"ping","timestamp":123}"#;
        let pong = r#"{"type":"pong","timestamp":456}"#;

        // when (操作):
        let probe = Envelope::decode(ping).unwrap();
        let ack = Envelope::decode(pong).unwrap();

        // then (期待する結果):
        assert_eq!(probe, Envelope::Heartbeat { timestamp: 123 });
        assert_eq!(ack, Envelope::HeartbeatAck { timestamp: 456 });
    }

    #[test]
    fn test_encode_uses_snake_case_tags() {
        // テスト項目: エンコード時の type タグが snake_case になる
        // given (前提条件):
        let envelope = Envelope::UserStatusChange {
            user_id: user("42"),
            status: PresenceStatus::Offline,
            last_seen: 1000,
        };

        // when (操作):
        let raw = envelope.encode().unwrap();

        // then (期待する結果):
        assert!(raw.contains(r#""type":"user_status_change""#));
        assert!(raw.contains(r#""status":"offline""#));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        // テスト項目: kind() がワイヤ上のタグと一致する
        // given (前提条件):
        let envelope = Envelope::JoinRoom {
            room_id: room("job-7"),
        };

        // when (操作):
        let raw = envelope.encode().unwrap();

        // then (期待する結果):
        assert!(raw.contains(&format!(r#""type":"{}""#, envelope.kind())));
    }
}
