//! Link State
//!
//! Shared, lock-light view of one upstream link, written by the link task
//! and read by the health server.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which upstream a link talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// Ingress tier to the market data vendor.
    Vendor,
    /// Bar-synthesis tier to the ingress tier.
    Ingress,
    /// Router to the ingress tier (trades, quotes, LULD, FMV).
    Ticks,
    /// Router to the bar-synthesis tier (native and millisecond bars).
    Bars,
}

impl LinkRole {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vendor => "vendor",
            Self::Ingress => "ingress",
            Self::Ticks => "ticks",
            Self::Bars => "bars",
        }
    }
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Opening the socket or waiting to retry.
    Connecting,
    /// Token accepted, subscriptions not yet reconciled.
    Authenticated,
    /// Subscribed and relaying data.
    Streaming,
    /// Socket lost.
    #[default]
    Disconnected,
}

/// Live state of one upstream link.
#[derive(Debug)]
pub struct LinkState {
    role: LinkRole,
    status: parking_lot::RwLock<LinkStatus>,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
    subscription_count: AtomicUsize,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
}

impl LinkState {
    /// Create state for a link that has not connected yet.
    #[must_use]
    pub const fn new(role: LinkRole) -> Self {
        Self {
            role,
            status: parking_lot::RwLock::new(LinkStatus::Disconnected),
            last_connected_at: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
            subscription_count: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
        }
    }

    /// Link role.
    #[must_use]
    pub const fn role(&self) -> LinkRole {
        self.role
    }

    /// Set the connection state.
    pub fn set_status(&self, status: LinkStatus) {
        *self.status.write() = status;
        if status == LinkStatus::Authenticated {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            *self.last_error.write() = None;
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status.read()
    }

    /// Whether the link is relaying data.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status() == LinkStatus::Streaming
    }

    /// Record a connection failure.
    pub fn record_failure(&self, message: String) {
        *self.status.write() = LinkStatus::Disconnected;
        *self.last_error.write() = Some(message);
    }

    /// Increment reconnect attempts.
    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment frames received.
    pub fn increment_frames(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the number of specs subscribed upstream.
    pub fn set_subscription_count(&self, count: usize) {
        self.subscription_count.store(count, Ordering::Relaxed);
    }

    /// Point-in-time view for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            role: self.role,
            status: self.status(),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            subscription_count: self.subscription_count.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

/// Serializable link view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    /// Link role
    pub role: LinkRole,
    /// Connection state
    pub status: LinkStatus,
    /// Last successful authentication
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Specs currently subscribed upstream
    pub subscription_count: usize,
    /// Attempts since the last successful connection
    pub reconnect_attempts: u32,
    /// Data frames received over the link's lifetime
    pub frames_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_clears_failure() {
        let state = LinkState::new(LinkRole::Ticks);
        state.record_failure("connection refused".to_string());
        state.increment_reconnect_attempts();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, LinkStatus::Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 1);

        state.set_status(LinkStatus::Authenticated);
        let snapshot = state.snapshot();
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_connected_at.is_some());
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!state.is_streaming());
    }

    #[test]
    fn snapshot_serializes_snake_case() {
        let state = LinkState::new(LinkRole::Bars);
        state.set_status(LinkStatus::Streaming);
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["role"], "bars");
        assert_eq!(json["status"], "streaming");
    }
}
