//! Broadcast Hub
//!
//! Firehose fan-out for the ingress and bar-synthesis tiers. One
//! `tokio::sync::broadcast` channel carries frames exactly as they will be
//! written to the socket; every internal client gets an identical copy.
//!
//! A receiver that falls more than `capacity` frames behind skips the gap
//! and keeps going. Market data has no redelivery requirement, so losing
//! stale frames beats stalling the publisher.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::infrastructure::metrics;
use crate::infrastructure::protocol::Frame;
use crate::infrastructure::server::{Delivery, OutboundQueue};

/// Default channel capacity in frames.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 16_384;

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Fan-out channel for raw frames.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::infrastructure::broadcast::FrameHub;
/// use market_stream_mux::infrastructure::protocol::Frame;
///
/// let hub = FrameHub::new(16);
/// let mut rx = hub.subscribe();
/// hub.publish(Frame::from_static(r#"[{"ev":"T","sym":"AAPL"}]"#));
/// assert_eq!(rx.try_recv().unwrap().as_str(), r#"[{"ev":"T","sym":"AAPL"}]"#);
/// ```
#[derive(Debug, Clone)]
pub struct FrameHub {
    tx: broadcast::Sender<Frame>,
}

impl FrameHub {
    /// Create a hub holding up to `capacity` unread frames per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Send a frame to every receiver.
    ///
    /// Returns the number of receivers reached; zero when nobody listens.
    pub fn publish(&self, frame: Frame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    /// New receiver starting at the next published frame.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            receivers: self.tx.receiver_count(),
            queued: self.tx.len(),
        }
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    /// Live receivers.
    pub receivers: usize,
    /// Frames not yet seen by the slowest receiver.
    pub queued: usize,
}

// =============================================================================
// Pump
// =============================================================================

/// Copy hub frames into one session's outbound queue until the session or
/// the hub goes away.
pub async fn pump(mut rx: broadcast::Receiver<Frame>, queue: OutboundQueue, tier: &'static str) {
    loop {
        let received = tokio::select! {
            () = queue.closed() => break,
            received = rx.recv() => received,
        };

        match received {
            Ok(frame) => {
                if queue.push(frame) != Delivery::Delivered {
                    break;
                }
                metrics::record_frames_forwarded(tier, 1);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    tier,
                    session_id = queue.session(),
                    skipped,
                    "Internal client lagged, frames skipped"
                );
                metrics::record_broadcast_lag(tier, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn publish_without_receivers_is_harmless() {
        let hub = FrameHub::new(4);
        assert_eq!(hub.publish(Frame::from_static("[]")), 0);
        assert_eq!(hub.stats(), HubStats::default());
    }

    #[test]
    fn every_receiver_gets_every_frame() {
        let hub = FrameHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.publish(Frame::from_static("one")), 2);
        assert_eq!(hub.publish(Frame::from_static("two")), 2);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap().as_str(), "one");
            assert_eq!(rx.try_recv().unwrap().as_str(), "two");
        }
        assert_eq!(hub.receiver_count(), 2);
    }

    #[tokio::test]
    async fn pump_survives_lag() {
        let hub = FrameHub::new(2);
        let rx = hub.subscribe();
        for i in 0..5 {
            hub.publish(Frame::from(format!("f{i}")));
        }

        let (queue, mut out) = OutboundQueue::new(1, "test", 16, CancellationToken::new());
        let task = tokio::spawn(pump(rx, queue, "test"));

        // Lagged past f0..f2, then resumes with the retained frames.
        let first = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
        assert_eq!(first.as_str(), "f3");

        hub.publish(Frame::from_static("live"));
        let mut seen = Vec::new();
        while let Ok(Some(frame)) = timeout(Duration::from_millis(200), out.recv()).await {
            seen.push(frame.as_str().to_string());
            if seen.last().map(String::as_str) == Some("live") {
                break;
            }
        }
        assert_eq!(seen, vec!["f4".to_string(), "live".to_string()]);

        drop(hub);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pump_stops_when_session_closes() {
        let hub = FrameHub::new(4);
        let closer = CancellationToken::new();
        let (queue, _out) = OutboundQueue::new(1, "test", 4, closer.clone());
        let task = tokio::spawn(pump(hub.subscribe(), queue, "test"));

        closer.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
