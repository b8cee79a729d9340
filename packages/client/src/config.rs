//! Managed connection configuration.

use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::reconnect::ReconnectConfig;

/// Everything a managed connection needs to know up front.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub url: String,
    /// Time allowed for the transport to open
    pub connect_timeout: Duration,
    /// Time allowed for the server to answer `authenticate`
    pub auth_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub breaker: BreakerConfig,
    /// Outbound queue bound (drop-oldest at capacity)
    pub queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            breaker: BreakerConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
