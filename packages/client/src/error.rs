//! Client-side error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the managed connection.
///
/// Transient transport failures are retried internally; callers only see an
/// error when a `connect()` attempt itself fails, authentication is rejected,
/// or the breaker refuses the call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// `connect()` refused while the circuit breaker cooldown is running
    #[error("circuit breaker is open; next attempt allowed in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// Transport or authentication did not complete within the window
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Server rejected the `authenticate` envelope; never retried
    #[error("authentication rejected: {reason}")]
    AuthenticationRejected { reason: String },

    /// Socket-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer closed the stream without a normal close
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No heartbeat acknowledgement within the window
    #[error("heartbeat acknowledgement missed")]
    HeartbeatTimeout,

    /// Envelope could not be serialized
    #[error("codec error: {0}")]
    Codec(String),
}
