//! Outbound Delivery Queue
//!
//! Bounded per-session queue drained by the session's writer task. A push
//! never waits: when the queue is full the session is closed as a slow
//! consumer instead of stalling the producer.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SessionId;
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::Frame;

/// Result of pushing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame queued.
    Delivered,
    /// Queue was full; the session is being closed.
    SlowConsumer,
    /// Session already gone.
    Closed,
}

/// Producer half of a session's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    session: SessionId,
    tier: &'static str,
    tx: mpsc::Sender<Frame>,
    closer: CancellationToken,
}

impl OutboundQueue {
    /// Create a queue of `capacity` frames.
    ///
    /// Cancelling `closer` tears the session down; the queue cancels it
    /// itself when the consumer falls behind.
    #[must_use]
    pub fn new(
        session: SessionId,
        tier: &'static str,
        capacity: usize,
        closer: CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                session,
                tier,
                tx,
                closer,
            },
            rx,
        )
    }

    /// Queue a frame without waiting.
    pub fn push(&self, frame: Frame) -> Delivery {
        if self.closer.is_cancelled() {
            return Delivery::Closed;
        }
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = self.session,
                    tier = self.tier,
                    capacity = self.tx.max_capacity(),
                    "Outbound queue full, closing slow client"
                );
                metrics::record_slow_client(self.tier);
                self.closer.cancel();
                Delivery::SlowConsumer
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Session this queue delivers to.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Whether the session has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the session is closed.
    pub async fn closed(&self) {
        tokio::select! {
            () = self.closer.cancelled() => {}
            () = self.tx.closed() => {}
        }
    }
}
