//! Shared server state: the registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use renraku_shared::envelope::Envelope;
use renraku_shared::ids::{ConnectionId, UserId};

use crate::config::ServerConfig;
use crate::persistence::PersistenceHook;
use crate::registry::RoomRegistry;

/// Handle to one connected, authenticated socket.
pub struct ClientHandle {
    pub user_id: UserId,
    /// Outbound channel into the socket's send task
    pub sender: mpsc::UnboundedSender<String>,
    /// Unix timestamp when authenticated (UTC, milliseconds)
    pub connected_at: i64,
}

/// Live connections keyed by connection id. A user may hold several
/// connections at once (multi-device), so fan-out to a user walks all of
/// their entries.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: ConnectionId, handle: ClientHandle) {
        let mut clients = self.clients.lock().await;
        clients.insert(connection_id, handle);
    }

    pub async fn unregister(&self, connection_id: &ConnectionId) -> Option<ClientHandle> {
        let mut clients = self.clients.lock().await;
        clients.remove(connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn user_connection_count(&self, user_id: &UserId) -> usize {
        let clients = self.clients.lock().await;
        clients
            .values()
            .filter(|handle| &handle.user_id == user_id)
            .count()
    }

    /// Push a frame to one connection. Returns false if it is gone.
    pub async fn send_to_connection(&self, connection_id: &ConnectionId, text: &str) -> bool {
        let clients = self.clients.lock().await;
        match clients.get(connection_id) {
            Some(handle) => handle.sender.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Push a frame to every connection of one user. Returns how many took it.
    pub async fn send_to_user(&self, user_id: &UserId, text: &str) -> usize {
        let clients = self.clients.lock().await;
        clients
            .values()
            .filter(|handle| &handle.user_id == user_id)
            .filter(|handle| handle.sender.send(text.to_string()).is_ok())
            .count()
    }

    /// Push a frame to every connection of each target user.
    pub async fn send_to_users(&self, targets: &[UserId], text: &str) -> usize {
        let clients = self.clients.lock().await;
        clients
            .values()
            .filter(|handle| targets.contains(&handle.user_id))
            .filter(|handle| handle.sender.send(text.to_string()).is_ok())
            .count()
    }

    /// Push a frame to every connection except those of `exclude`.
    pub async fn broadcast_except_user(&self, exclude: &UserId, text: &str) -> usize {
        let clients = self.clients.lock().await;
        clients
            .values()
            .filter(|handle| &handle.user_id != exclude)
            .filter(|handle| handle.sender.send(text.to_string()).is_ok())
            .count()
    }
}

/// Shared application state
pub struct AppState {
    pub clients: Arc<ClientRegistry>,
    pub registry: Arc<RoomRegistry>,
    pub persistence: Arc<dyn PersistenceHook>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(persistence: Arc<dyn PersistenceHook>, config: ServerConfig) -> Self {
        Self {
            clients: Arc::new(ClientRegistry::new()),
            registry: Arc::new(RoomRegistry::new(config.typing_ttl)),
            persistence,
            config,
        }
    }
}

/// Encode an envelope for fan-out. A failure here is a bug worth a log line,
/// never a crash.
pub(crate) fn encode_or_log(envelope: &Envelope) -> Option<String> {
    match envelope.encode() {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("failed to encode '{}' envelope: {}", envelope.kind(), e);
            None
        }
    }
}
