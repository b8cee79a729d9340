//! Identifier value objects shared between client and server.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier validation errors
#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Authenticated user identifier.
///
/// Identity is established outside this subsystem (the marketplace's auth
/// layer); the transport only carries the id around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(IdError::Empty("user id"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room identifier. A room is scoped to exactly one job listing, so the room
/// id is the job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(IdError::Empty("room id"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-socket identifier minted by the server on upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a message id for delivery-status correlation.
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_accepts_non_empty_value() {
        // テスト項目: 空でない値から UserId が作成できる
        // given (前提条件):
        let value = "worker-42";

        // when (操作):
        let result = UserId::new(value);

        // then (期待する結果):
        assert_eq!(result.unwrap().as_str(), "worker-42");
    }

    #[test]
    fn test_user_id_rejects_empty_value() {
        // テスト項目: 空文字・空白のみの UserId は拒否される
        // given (前提条件):
        // when (操作):
        let empty = UserId::new("");
        let blank = UserId::new("   ");

        // then (期待する結果):
        assert_eq!(empty, Err(IdError::Empty("user id")));
        assert_eq!(blank, Err(IdError::Empty("user id")));
    }

    #[test]
    fn test_room_id_rejects_empty_value() {
        // テスト項目: 空の RoomId は拒否される
        // given (前提条件):
        // when (操作):
        let result = RoomId::new("");

        // then (期待する結果):
        assert_eq!(result, Err(IdError::Empty("room id")));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        // テスト項目: 生成される ConnectionId は一意である
        // given (前提条件):
        // when (操作):
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();

        // then (期待する結果):
        assert_ne!(a, b);
    }
}
