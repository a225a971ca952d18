//! Firehose Service
//!
//! Unfiltered fan-out used by the ingress tier: every authenticated session
//! receives every data frame from the hub, byte for byte. `subscribe` and
//! `unsubscribe` are acknowledged by the server but change nothing here.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SessionHandler;
use crate::domain::subscription::{SessionId, SubscriptionSpec};
use crate::infrastructure::broadcast::{FrameHub, pump};
use crate::infrastructure::server::OutboundQueue;
use crate::infrastructure::upstream::LinkEvent;

/// Session handler that attaches each session to a [`FrameHub`].
#[derive(Debug, Clone)]
pub struct FirehoseService {
    hub: FrameHub,
    tier: &'static str,
}

impl FirehoseService {
    /// Serve frames from `hub`.
    #[must_use]
    pub const fn new(hub: FrameHub, tier: &'static str) -> Self {
        Self { hub, tier }
    }
}

#[async_trait]
impl SessionHandler for FirehoseService {
    async fn on_authenticated(&self, session: SessionId, queue: OutboundQueue) {
        tokio::spawn(pump(self.hub.subscribe(), queue, self.tier));
        tracing::debug!(tier = self.tier, session_id = session, receivers = self.hub.receiver_count(), "Firehose attached");
    }

    async fn on_subscribe(&self, _session: SessionId, _specs: &[SubscriptionSpec]) {}

    async fn on_unsubscribe(&self, _session: SessionId, _specs: &[SubscriptionSpec]) {}

    async fn on_closed(&self, _session: SessionId) {}
}

/// Publish every data frame from an upstream link onto `hub`, verbatim.
pub async fn relay_link_events(
    mut events: mpsc::Receiver<LinkEvent>,
    hub: FrameHub,
    tier: &'static str,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            LinkEvent::Frame(frame) => {
                hub.publish(frame);
            }
            LinkEvent::Connected => tracing::info!(tier, "Upstream connected"),
            LinkEvent::Subscribed { count } => tracing::info!(tier, count, "Upstream subscription active"),
            LinkEvent::Disconnected => tracing::warn!(tier, "Upstream disconnected, data gap until reconnect"),
            LinkEvent::Reconnecting { attempt } => tracing::info!(tier, attempt, "Upstream reconnecting"),
            LinkEvent::Error(message) => tracing::error!(tier, error = %message, "Upstream error"),
        }
    }
}
