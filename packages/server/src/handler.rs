//! WebSocket connection handling.
//!
//! Upgrade, then a strict little handshake: the server volunteers
//! `connection_ack`, the client must answer with `authenticate` inside the
//! auth window, and only then does the socket join the registries and start
//! routing. Identity is established elsewhere; the handshake only binds an
//! already-authenticated user id to this socket.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use renraku_shared::envelope::Envelope;
use renraku_shared::ids::{ConnectionId, UserId};
use renraku_shared::time::get_utc_timestamp;

use crate::router::{ConnectionContext, MessageRouter};
use crate::state::{AppState, ClientHandle, encode_or_log};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();
    let (mut sender, mut receiver) = socket.split();

    let ack = Envelope::ConnectionAck {
        connection_id: connection_id.to_string(),
    };
    if let Some(json) = encode_or_log(&ack) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    // Bind the socket to a user id, or close it.
    let user_id = match wait_for_authenticate(&mut receiver, &state).await {
        AuthOutcome::Authenticated(user_id) => user_id,
        AuthOutcome::Refused(reason) => {
            tracing::warn!("closing unauthenticated socket {}: {}", connection_id, reason);
            refuse(&mut sender, reason).await;
            return;
        }
        AuthOutcome::Gone => return,
    };

    let connected_at = get_utc_timestamp();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .clients
        .register(
            connection_id.clone(),
            ClientHandle {
                user_id: user_id.clone(),
                sender: tx,
                connected_at,
            },
        )
        .await;

    let authenticated = Envelope::Authenticated {
        user_id: user_id.clone(),
        connection_id: connection_id.to_string(),
    };
    if let Some(json) = encode_or_log(&authenticated) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            state.clients.unregister(&connection_id).await;
            return;
        }
    }
    tracing::info!("'{}' authenticated on connection {}", user_id, connection_id);

    state
        .registry
        .mark_online(&state.clients, &user_id, connected_at)
        .await;

    let router = MessageRouter::new(state.clone());
    let ctx = ConnectionContext {
        connection_id: connection_id.clone(),
        user_id: user_id.clone(),
    };

    // One task pulls frames off the socket into the router, one pushes
    // registry fan-out onto the socket. Either ending ends both.
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("websocket read error: {}", e);
                    break;
                }
            };
            match message {
                Message::Text(text) => match Envelope::decode(text.as_str()) {
                    Ok(envelope) => router.route(&ctx, envelope).await,
                    Err(e) => tracing::warn!("undecodable frame from '{}': {}", ctx.user_id, e),
                },
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
                _ => {}
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    // Teardown: drop the connection, then let the registry do the implicit
    // leaves and the presence flip if this was the user's last device.
    state.clients.unregister(&connection_id).await;
    state
        .registry
        .handle_disconnect(&state.clients, &user_id, get_utc_timestamp())
        .await;
    tracing::info!("connection {} for '{}' closed", connection_id, user_id);
}

enum AuthOutcome {
    Authenticated(UserId),
    Refused(String),
    Gone,
}

async fn wait_for_authenticate(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> AuthOutcome {
    let wait = tokio::time::timeout(state.config.auth_timeout, async {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    return match Envelope::decode(text.as_str()) {
                        Ok(Envelope::Authenticate { user_id }) => {
                            // the envelope decodes any string; re-validate here
                            match UserId::new(user_id.as_str()) {
                                Ok(user_id) => AuthOutcome::Authenticated(user_id),
                                Err(e) => AuthOutcome::Refused(format!("invalid user id: {}", e)),
                            }
                        }
                        Ok(other) => AuthOutcome::Refused(format!(
                            "expected authenticate, got '{}'",
                            other.kind()
                        )),
                        Err(e) => AuthOutcome::Refused(format!("undecodable frame: {}", e)),
                    };
                }
                Ok(Message::Close(_)) => return AuthOutcome::Gone,
                Ok(_) => {}
                Err(_) => return AuthOutcome::Gone,
            }
        }
        AuthOutcome::Gone
    })
    .await;
    match wait {
        Ok(outcome) => outcome,
        Err(_) => AuthOutcome::Refused("authentication timed out".to_string()),
    }
}

async fn refuse(sender: &mut SplitSink<WebSocket, Message>, reason: String) {
    let error = Envelope::Error {
        code: "auth_failed".to_string(),
        message: reason,
    };
    if let Some(json) = encode_or_log(&error) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication required".into(),
        })))
        .await;
}
