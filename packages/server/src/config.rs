//! Server configuration.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// How long a typing indicator lives without a refresh or explicit stop
    pub typing_ttl: Duration,
    /// How long a fresh socket may take to send `authenticate`
    pub auth_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
        }
    }
}
