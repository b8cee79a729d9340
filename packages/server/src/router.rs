//! Inbound envelope dispatch.
//!
//! One router instance serves every connection. It trusts nothing a client
//! says about its own identity: any sender field that does not match the
//! connection's authenticated user is answered with an `error` envelope to
//! that connection only, and nothing is forwarded. Unknown envelope types are
//! logged and dropped, so older servers tolerate newer clients.

use std::sync::Arc;

use renraku_shared::envelope::Envelope;
use renraku_shared::ids::{ConnectionId, RoomId, UserId};
use renraku_shared::time::get_utc_timestamp;

use crate::persistence::StoredMessage;
use crate::state::{AppState, encode_or_log};

/// Identity of the connection an envelope arrived on.
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

pub struct MessageRouter {
    state: Arc<AppState>,
}

impl MessageRouter {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn route(&self, ctx: &ConnectionContext, envelope: Envelope) {
        match envelope {
            Envelope::Heartbeat { timestamp } => {
                self.reply(ctx, &Envelope::HeartbeatAck { timestamp }).await;
            }
            Envelope::JoinRoom { room_id } => {
                let members = self
                    .state
                    .registry
                    .join_room(
                        &self.state.clients,
                        &ctx.user_id,
                        &room_id,
                        get_utc_timestamp(),
                    )
                    .await;
                self.reply(ctx, &Envelope::RoomJoined { room_id, members })
                    .await;
            }
            Envelope::LeaveRoom { room_id } => {
                self.state
                    .registry
                    .leave_room(
                        &self.state.clients,
                        &ctx.user_id,
                        &room_id,
                        get_utc_timestamp(),
                    )
                    .await;
            }
            Envelope::Typing { room_id, user_id } => {
                if user_id != ctx.user_id {
                    self.reject_spoof(ctx, "typing", &user_id).await;
                    return;
                }
                self.state
                    .registry
                    .typing(&self.state.clients, &ctx.user_id, &room_id)
                    .await;
            }
            Envelope::StopTyping { room_id, user_id } => {
                if user_id != ctx.user_id {
                    self.reject_spoof(ctx, "stop_typing", &user_id).await;
                    return;
                }
                self.state
                    .registry
                    .stop_typing(&self.state.clients, &ctx.user_id, &room_id)
                    .await;
            }
            Envelope::SendMessage {
                sender_id,
                recipient_id,
                room_id,
                content,
                message_id,
                timestamp,
            } => {
                if sender_id != ctx.user_id {
                    self.reject_spoof(ctx, "send_message", &sender_id).await;
                    return;
                }
                self.handle_send_message(ctx, recipient_id, room_id, content, message_id, timestamp)
                    .await;
            }
            Envelope::MarkRead {
                reader_id,
                sender_id,
                message_id,
            } => {
                if reader_id != ctx.user_id {
                    self.reject_spoof(ctx, "mark_read", &reader_id).await;
                    return;
                }
                self.handle_mark_read(ctx, sender_id, message_id).await;
            }
            Envelope::HeartbeatAck { .. } => {}
            Envelope::Error { code, message } => {
                tracing::warn!(
                    "error envelope from '{}' ({}): {}",
                    ctx.user_id,
                    code,
                    message
                );
            }
            Envelope::Unknown => {
                tracing::debug!("ignoring envelope with unknown type from '{}'", ctx.user_id);
            }
            // server-origin types have no business arriving from a client
            other => {
                tracing::debug!(
                    "ignoring unexpected '{}' envelope from '{}'",
                    other.kind(),
                    ctx.user_id
                );
            }
        }
    }

    async fn handle_send_message(
        &self,
        ctx: &ConnectionContext,
        recipient_id: Option<UserId>,
        room_id: Option<RoomId>,
        content: String,
        message_id: String,
        timestamp: i64,
    ) {
        // storage is fire-and-forget; routing never waits on it
        let stored = StoredMessage {
            message_id: message_id.clone(),
            sender_id: ctx.user_id.clone(),
            recipient_id: recipient_id.clone(),
            room_id: room_id.clone(),
            content: content.clone(),
            timestamp,
        };
        let persistence = Arc::clone(&self.state.persistence);
        tokio::spawn(async move {
            let id = stored.message_id.clone();
            if let Err(e) = persistence.persist_message(stored).await {
                tracing::error!("failed to persist message {}: {}", id, e);
            }
        });

        let fan_out = Envelope::NewMessage {
            sender_id: ctx.user_id.clone(),
            recipient_id: recipient_id.clone(),
            room_id: room_id.clone(),
            content,
            message_id: message_id.clone(),
            timestamp,
        };
        let Some(json) = encode_or_log(&fan_out) else {
            return;
        };

        let delivered = match (&room_id, &recipient_id) {
            (Some(room_id), _) => {
                let members = self.state.registry.members_of(room_id).await;
                let targets: Vec<UserId> = members
                    .into_iter()
                    .filter(|member| member != &ctx.user_id)
                    .collect();
                self.state.clients.send_to_users(&targets, &json).await
            }
            (None, Some(recipient_id)) => {
                // offline recipients are best-effort: no server-side queueing
                self.state.clients.send_to_user(recipient_id, &json).await
            }
            (None, None) => {
                self.reject(
                    ctx,
                    "missing_destination",
                    "send_message needs a room_id or a recipient_id".to_string(),
                )
                .await;
                return;
            }
        };

        self.reply(
            ctx,
            &Envelope::MessageSent {
                message_id: message_id.clone(),
                timestamp: get_utc_timestamp(),
            },
        )
        .await;

        if room_id.is_none() {
            if let Some(recipient_id) = recipient_id {
                if delivered > 0 {
                    self.reply(
                        ctx,
                        &Envelope::MessageDelivered {
                            message_id,
                            recipient_id,
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_mark_read(
        &self,
        ctx: &ConnectionContext,
        sender_id: UserId,
        message_id: String,
    ) {
        let persistence = Arc::clone(&self.state.persistence);
        let reader_id = ctx.user_id.clone();
        let persisted_id = message_id.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence
                .persist_read_receipt(reader_id, persisted_id)
                .await
            {
                tracing::error!("failed to persist read receipt: {}", e);
            }
        });

        // the receipt goes to the original sender's connections only
        let receipt = Envelope::MessageRead {
            reader_id: ctx.user_id.clone(),
            message_id,
            timestamp: get_utc_timestamp(),
        };
        if let Some(json) = encode_or_log(&receipt) {
            self.state.clients.send_to_user(&sender_id, &json).await;
        }
    }

    async fn reply(&self, ctx: &ConnectionContext, envelope: &Envelope) {
        if let Some(json) = encode_or_log(envelope) {
            self.state
                .clients
                .send_to_connection(&ctx.connection_id, &json)
                .await;
        }
    }

    async fn reject(&self, ctx: &ConnectionContext, code: &str, message: String) {
        tracing::warn!("rejecting envelope from '{}': {}", ctx.user_id, message);
        self.reply(
            ctx,
            &Envelope::Error {
                code: code.to_string(),
                message,
            },
        )
        .await;
    }

    async fn reject_spoof(&self, ctx: &ConnectionContext, kind: &str, claimed: &UserId) {
        self.reject(
            ctx,
            "sender_mismatch",
            format!(
                "{} claims sender '{}' but the connection is authenticated as '{}'",
                kind, claimed, ctx.user_id
            ),
        )
        .await;
    }
}
