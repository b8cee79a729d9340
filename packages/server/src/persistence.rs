//! Persistence seam for chat messages and read receipts.
//!
//! Storage lives outside this subsystem. The router hands finished messages to
//! this hook fire-and-forget: routing never waits on storage, and a storage
//! failure is logged, not propagated to the wire.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use renraku_shared::ids::{RoomId, UserId};

/// A chat message as handed to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub room_id: Option<RoomId>,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    async fn persist_message(&self, message: StoredMessage) -> Result<(), PersistenceError>;

    async fn persist_read_receipt(
        &self,
        reader_id: UserId,
        message_id: String,
    ) -> Result<(), PersistenceError>;
}

/// Default hook for deployments where another service owns storage entirely.
pub struct NoopPersistence;

#[async_trait]
impl PersistenceHook for NoopPersistence {
    async fn persist_message(&self, message: StoredMessage) -> Result<(), PersistenceError> {
        tracing::debug!("skipping persistence for message {}", message.message_id);
        Ok(())
    }

    async fn persist_read_receipt(
        &self,
        reader_id: UserId,
        message_id: String,
    ) -> Result<(), PersistenceError> {
        tracing::debug!(
            "skipping persistence for read receipt {} by {}",
            message_id,
            reader_id
        );
        Ok(())
    }
}
