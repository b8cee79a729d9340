//! Formatting of connection events for terminal display.

use renraku_shared::envelope::{Envelope, PresenceStatus};
use renraku_shared::ids::UserId;
use renraku_shared::time::timestamp_to_rfc3339;

use crate::connection::ConnectionState;
use crate::events::ClientEvent;

/// Event formatter for the CLI client
pub struct MessageFormatter;

impl MessageFormatter {
    /// Render one event, or `None` for events the terminal UI does not show.
    pub fn format_event(event: &ClientEvent, me: &UserId) -> Option<String> {
        match event {
            ClientEvent::Envelope(envelope) => Self::format_envelope(envelope, me),
            ClientEvent::StateChanged(state) => Some(Self::format_state(*state)),
            ClientEvent::ProtocolError { code, message } => {
                Some(format!("\n! server error ({}): {}\n", code, message))
            }
            ClientEvent::AuthenticationFailed { reason } => {
                Some(format!("\n! authentication failed: {}\n", reason))
            }
            ClientEvent::ReconnectScheduled { attempt, delay } => Some(format!(
                "\n[connection] lost; retry {} in {:.1}s\n",
                attempt,
                delay.as_secs_f64()
            )),
            ClientEvent::ReconnectExhausted => {
                Some("\n[connection] gave up reconnecting\n".to_string())
            }
            ClientEvent::CircuitOpened => {
                Some("\n[connection] circuit breaker opened; cooling down\n".to_string())
            }
        }
    }

    fn format_state(state: ConnectionState) -> String {
        let label = match state {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting...",
            ConnectionState::Authenticating => "authenticating...",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting...",
            ConnectionState::CircuitOpen => "circuit open",
        };
        format!("\n[connection] {}\n", label)
    }

    fn format_envelope(envelope: &Envelope, me: &UserId) -> Option<String> {
        match envelope {
            Envelope::NewMessage {
                sender_id,
                room_id,
                content,
                timestamp,
                ..
            } => {
                let scope = match room_id {
                    Some(room) => format!("[{}] ", room),
                    None => "[dm] ".to_string(),
                };
                Some(format!(
                    "\n\n------------------------------------------------------------\n\
                     {}@{}: {}\n\
                     sent at {}\n\
                     ------------------------------------------------------------\n",
                    scope,
                    sender_id,
                    content,
                    timestamp_to_rfc3339(*timestamp)
                ))
            }
            Envelope::RoomJoined { room_id, members } => {
                let mut output = String::new();
                output.push_str("\n\n============================================================\n");
                output.push_str(&format!("Room {} members:\n", room_id));
                if members.is_empty() {
                    output.push_str("(nobody here)\n");
                } else {
                    for member in members {
                        let me_suffix = if member == me { " (me)" } else { "" };
                        output.push_str(&format!("{}{}\n", member, me_suffix));
                    }
                }
                output.push_str("============================================================\n");
                Some(output)
            }
            Envelope::UserJoinedRoom {
                room_id, user_id, ..
            } => Some(format!("\n+ {} joined {}\n", user_id, room_id)),
            Envelope::UserLeftRoom {
                room_id, user_id, ..
            } => Some(format!("\n- {} left {}\n", user_id, room_id)),
            Envelope::UserTyping { room_id, user_id } => {
                Some(format!("\n... {} is typing in {}\n", user_id, room_id))
            }
            Envelope::UserStoppedTyping { room_id, user_id } => {
                Some(format!("\n... {} stopped typing in {}\n", user_id, room_id))
            }
            Envelope::UserStatusChange {
                user_id, status, ..
            } => {
                let label = match status {
                    PresenceStatus::Online => "online",
                    PresenceStatus::Offline => "offline",
                };
                Some(format!("\n* {} is now {}\n", user_id, label))
            }
            Envelope::MessageSent { message_id, .. } => {
                Some(format!("\n(sent: {})\n", message_id))
            }
            Envelope::MessageDelivered {
                message_id,
                recipient_id,
            } => Some(format!("\n(delivered to {}: {})\n", recipient_id, message_id)),
            Envelope::MessageRead {
                reader_id,
                message_id,
                ..
            } => Some(format!("\n(read by {}: {})\n", reader_id, message_id)),
            _ => None,
        }
    }
}
