//! Reconnection scheduling: exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Reconnection scheduler configuration
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponential component
    pub max_delay: Duration,
    /// Hard ceiling on total retry attempts before giving up
    pub max_attempts: u32,
    /// Upper bound of the random jitter addend
    pub jitter_max: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_max: Duration::from_millis(1000),
        }
    }
}

/// Owns the retry counter and computes the delay for each scheduled retry.
///
/// Delay is `min(base × 1.5^attempt, max) + jitter`, where jitter is a random
/// addend in `0..=jitter_max` so a fleet of clients dropped by the same server
/// restart does not reconnect in lockstep.
#[derive(Debug)]
pub struct ReconnectSchedule {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Retries scheduled since the last authenticated success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset on authenticated success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry, or `None` once the attempt ceiling is
    /// reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let exponential =
            self.config.base_delay.as_millis() as f64 * 1.5f64.powi(self.attempt as i32);
        let capped = exponential.min(self.config.max_delay.as_millis() as f64) as u64;
        self.attempt += 1;
        Some(Duration::from_millis(capped) + jitter(self.config.jitter_max))
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}
