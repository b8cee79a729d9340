//! Heartbeat bookkeeping for a live connection.
//!
//! While connected, the driver sends a probe every `interval` and expects an
//! acknowledgement within `ack_timeout`. A missed acknowledgement closes the
//! socket proactively instead of waiting for the transport to notice a dead
//! peer. This struct only tracks the deadlines; the connection driver owns the
//! timers.

use std::time::{Duration, Instant};

/// Heartbeat configuration
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Probe interval
    pub interval: Duration,
    /// Window in which an acknowledgement must arrive
    pub ack_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    awaiting_ack_since: Option<Instant>,
    last_ack_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            awaiting_ack_since: None,
            last_ack_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// A probe went out. The deadline is anchored to the first unacknowledged
    /// probe; later probes do not extend it.
    pub fn on_probe_sent(&mut self, now: Instant) {
        if self.awaiting_ack_since.is_none() {
            self.awaiting_ack_since = Some(now);
        }
    }

    pub fn on_ack(&mut self, now: Instant) {
        self.awaiting_ack_since = None;
        self.last_ack_at = Some(now);
    }

    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    /// Deadline for the outstanding probe, if one is unacknowledged.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.awaiting_ack_since
            .map(|since| since + self.config.ack_timeout)
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        match self.ack_deadline() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_no_deadline_before_first_probe() {
        // テスト項目: プローブ送信前はデッドラインが存在しない
        // given (前提条件):
        let monitor = monitor();

        // when (操作) / then (期待する結果):
        assert_eq!(monitor.ack_deadline(), None);
        assert!(!monitor.is_timed_out(Instant::now()));
    }

    #[test]
    fn test_ack_clears_the_deadline() {
        // テスト項目: ack 受信でデッドラインが解除される
        // given (前提条件):
        let mut monitor = monitor();
        let sent_at = Instant::now();
        monitor.on_probe_sent(sent_at);
        assert!(monitor.ack_deadline().is_some());

        // when (操作):
        let acked_at = sent_at + Duration::from_secs(1);
        monitor.on_ack(acked_at);

        // then (期待する結果):
        assert_eq!(monitor.ack_deadline(), None);
        assert_eq!(monitor.last_ack_at(), Some(acked_at));
        assert!(!monitor.is_timed_out(sent_at + Duration::from_secs(60)));
    }

    #[test]
    fn test_missed_ack_times_out() {
        // テスト項目: ack が来ないまま ack_timeout を過ぎるとタイムアウト
        // given (前提条件):
        let mut monitor = monitor();
        let sent_at = Instant::now();
        monitor.on_probe_sent(sent_at);

        // when (操作) / then (期待する結果):
        assert!(!monitor.is_timed_out(sent_at + Duration::from_secs(9)));
        assert!(monitor.is_timed_out(sent_at + Duration::from_secs(10)));
    }

    #[test]
    fn test_later_probes_do_not_extend_the_deadline() {
        // テスト項目: 未応答のまま次のプローブを送ってもデッドラインは延びない
        // given (前提条件):
        let mut monitor = monitor();
        let first = Instant::now();
        monitor.on_probe_sent(first);

        // when (操作): 5 秒後に 2 本目のプローブ
        monitor.on_probe_sent(first + Duration::from_secs(5));

        // then (期待する結果): デッドラインは 1 本目基準のまま
        assert_eq!(monitor.ack_deadline(), Some(first + Duration::from_secs(10)));
    }
}
