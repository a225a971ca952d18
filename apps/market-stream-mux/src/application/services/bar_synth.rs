//! Bar-Synthesis Service
//!
//! Two halves joined by a `watch` channel:
//!
//! - [`BarSynthService`] handles downstream sessions. Every session gets the
//!   full output firehose; the `<N>Ms.<SYMBOL>` specs sessions hold decide
//!   which `(symbol, interval)` pairs get buckets at all.
//! - [`BarEngine`] owns the [`BarAggregator`] and is the only task touching
//!   it. It turns each inbound frame from the ingress link into at most one
//!   outbound array: native bars relayed verbatim plus bars closed by the
//!   frame's trades, in arrival order.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::value::RawValue;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::SessionHandler;
use crate::domain::aggregation::{BarAggregator, BarInterest};
use crate::domain::streaming::{NativeBar, Trade};
use crate::domain::subscription::{SessionId, SubscriptionRegistry, SubscriptionSpec};
use crate::infrastructure::broadcast::{FrameHub, pump};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{Frame, FrameCodec};
use crate::infrastructure::server::OutboundQueue;
use crate::infrastructure::upstream::LinkEvent;

const TIER: &str = "bar_synth";

// =============================================================================
// Session Side
// =============================================================================

/// Session handler for the bar-synthesis tier.
pub struct BarSynthService {
    hub: FrameHub,
    registry: RwLock<SubscriptionRegistry>,
    interest: watch::Sender<BarInterest>,
}

impl BarSynthService {
    /// Serve frames from `hub`.
    #[must_use]
    pub fn new(hub: FrameHub) -> Self {
        Self {
            hub,
            registry: RwLock::new(SubscriptionRegistry::new()),
            interest: watch::Sender::new(BarInterest::new()),
        }
    }

    /// Receiver for the engine; yields the latest wanted pairs.
    #[must_use]
    pub fn interest(&self) -> watch::Receiver<BarInterest> {
        self.interest.subscribe()
    }

    /// Rebuild interest from the registry. Called with the write lock held
    /// so updates are published in mutation order.
    fn publish_interest(&self, registry: &SubscriptionRegistry) {
        let next: BarInterest = registry.millisecond_interest().collect();
        self.interest.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(tier = TIER, pairs = next.len(), "Bar interest changed");
            *current = next;
            true
        });
    }
}

#[async_trait]
impl SessionHandler for BarSynthService {
    async fn on_authenticated(&self, _session: SessionId, queue: OutboundQueue) {
        tokio::spawn(pump(self.hub.subscribe(), queue, TIER));
    }

    async fn on_subscribe(&self, session: SessionId, specs: &[SubscriptionSpec]) {
        let mut registry = self.registry.write();
        registry.subscribe(session, specs);
        self.publish_interest(&registry);
    }

    async fn on_unsubscribe(&self, session: SessionId, specs: &[SubscriptionSpec]) {
        let mut registry = self.registry.write();
        registry.unsubscribe(session, specs);
        self.publish_interest(&registry);
    }

    async fn on_closed(&self, session: SessionId) {
        let mut registry = self.registry.write();
        registry.remove_session(session);
        self.publish_interest(&registry);
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Aggregation actor.
pub struct BarEngine {
    aggregator: BarAggregator,
    codec: FrameCodec,
    hub: FrameHub,
}

impl BarEngine {
    /// Engine publishing onto `hub`.
    #[must_use]
    pub fn new(hub: FrameHub) -> Self {
        Self {
            aggregator: BarAggregator::new(),
            codec: FrameCodec::new(),
            hub,
        }
    }

    /// Replace the wanted pairs.
    pub fn set_interest(&mut self, interest: BarInterest) {
        self.aggregator.set_interest(interest);
        tracing::debug!(tier = TIER, open_buckets = self.aggregator.open_buckets(), "Interest applied");
    }

    /// Consume link events until cancelled or the link goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut interest: watch::Receiver<BarInterest>,
        cancel: CancellationToken,
    ) {
        self.set_interest(interest.borrow_and_update().clone());
        let mut watching = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = interest.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let next = interest.borrow_and_update().clone();
                    self.set_interest(next);
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.on_event(event);
                }
            }
        }

        tracing::info!(tier = TIER, "Bar engine stopped");
    }

    fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => {
                if let Some(out) = self.process_frame(&frame) {
                    self.hub.publish(Frame::from(out));
                }
            }
            LinkEvent::Connected => tracing::info!(tier = TIER, "Ingress link connected"),
            LinkEvent::Subscribed { count } => tracing::info!(tier = TIER, count, "Ingress subscription active"),
            LinkEvent::Disconnected => tracing::warn!(tier = TIER, "Ingress link disconnected"),
            LinkEvent::Reconnecting { attempt } => tracing::info!(tier = TIER, attempt, "Ingress link reconnecting"),
            LinkEvent::Error(message) => tracing::error!(tier = TIER, error = %message, "Ingress link error"),
        }
    }

    /// Turn one inbound frame into the outbound array, if it produced
    /// anything.
    pub fn process_frame(&mut self, text: &str) -> Option<String> {
        let envelopes = match self.codec.split(text) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::debug!(tier = TIER, error = %e, "Undecodable frame dropped");
                metrics::record_malformed(TIER, e.kind());
                return None;
            }
        };

        let mut out: Vec<Box<str>> = Vec::new();
        let mut emitted = 0_u64;
        let mut late = 0_u64;

        for envelope in envelopes {
            match self.codec.event_code(envelope) {
                Some("T") => {
                    let Some(trade) = Self::decode_trade(envelope) else {
                        continue;
                    };
                    let outcome = self.aggregator.on_trade(&trade);
                    late += u64::from(outcome.late);
                    for bar in &outcome.bars {
                        match self.codec.encode(bar) {
                            Ok(json) => {
                                out.push(json.into_boxed_str());
                                emitted += 1;
                            }
                            Err(e) => tracing::error!(tier = TIER, error = %e, "Failed to encode bar"),
                        }
                    }
                }
                Some("A" | "AM") => {
                    if Self::is_valid_native(envelope) {
                        out.push(envelope.get().into());
                    }
                }
                _ => {}
            }
        }

        if emitted > 0 {
            metrics::record_bars_emitted(emitted);
        }
        if late > 0 {
            tracing::debug!(tier = TIER, late, "Late trades folded into open buckets");
            metrics::record_late_trades(late);
        }

        if out.is_empty() {
            None
        } else {
            Some(self.codec.join(out.iter().map(AsRef::as_ref)))
        }
    }

    fn decode_trade(envelope: &RawValue) -> Option<Trade> {
        match serde_json::from_str::<Trade>(envelope.get()) {
            Ok(trade) => Some(trade),
            Err(e) => {
                tracing::debug!(tier = TIER, error = %e, "Malformed trade dropped");
                metrics::record_malformed(TIER, "trade");
                None
            }
        }
    }

    /// Natives are relayed as received, but only when they decode.
    fn is_valid_native(envelope: &RawValue) -> bool {
        match serde_json::from_str::<NativeBar>(envelope.get()) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(tier = TIER, error = %e, "Malformed native bar dropped");
                metrics::record_malformed(TIER, "native_bar");
                false
            }
        }
    }

    /// Open buckets per symbol, for diagnostics.
    #[must_use]
    pub fn open_buckets(&self) -> usize {
        self.aggregator.open_buckets()
    }
}
