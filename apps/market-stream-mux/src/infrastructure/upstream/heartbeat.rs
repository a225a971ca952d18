//! Link Heartbeat
//!
//! Keeps an upstream link honest: pings on a fixed cadence and declares the
//! link dead when nothing arrives for `timeout` after a ping. Any inbound
//! frame counts as a sign of life, not only pongs.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::LinkSettings;

/// Heartbeat cadence and tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence tolerated after an unanswered ping.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for HeartbeatConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the link should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a ping.
    Ping,
    /// The peer went silent; drop the connection.
    Expired,
}

/// Per-connection heartbeat driven from the link's select loop.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    ticker: Interval,
    unanswered_since: Option<Instant>,
}

impl Heartbeat {
    /// Start a heartbeat; the first tick fires one interval from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let period = config.ping_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            config,
            ticker,
            unanswered_since: None,
        }
    }

    /// Wait for the next tick. Cancel safe.
    pub async fn tick(&mut self) -> Beat {
        self.ticker.tick().await;

        match self.unanswered_since {
            Some(since) if since.elapsed() >= self.config.timeout => Beat::Expired,
            Some(_) => Beat::Ping,
            None => {
                self.unanswered_since = Some(Instant::now());
                Beat::Ping
            }
        }
    }

    /// Record inbound traffic.
    pub fn record_activity(&mut self) {
        self.unanswered_since = None;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.unanswered_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ping_ms: u64, timeout_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_millis(ping_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn defaults_follow_link_settings() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.timeout, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn silent_peer_expires() {
        let mut heartbeat = Heartbeat::new(config(50, 75));

        assert_eq!(heartbeat.tick().await, Beat::Ping);
        assert!(heartbeat.is_waiting());
        assert_eq!(heartbeat.tick().await, Beat::Ping);
        assert_eq!(heartbeat.tick().await, Beat::Expired);
    }

    #[tokio::test]
    async fn activity_keeps_link_alive() {
        let mut heartbeat = Heartbeat::new(config(50, 75));

        for _ in 0..5 {
            assert_eq!(heartbeat.tick().await, Beat::Ping);
            heartbeat.record_activity();
            assert!(!heartbeat.is_waiting());
        }
    }
}
