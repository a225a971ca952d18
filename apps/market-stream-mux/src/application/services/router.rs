//! Subscription Router Service
//!
//! Filtered proxy between clients and the two internal tiers.
//!
//! - Session commands mutate the [`SubscriptionRegistry`] under the write
//!   lock and, in the same critical section, hand any changed minimal
//!   upstream set to the [`UpstreamPort`].
//! - Inbound frames are routed under the read lock only: each envelope's
//!   `(class, symbol)` key is looked up in the spec index and the envelope
//!   text is queued, unmodified, for every matching session.
//!
//! Envelopes from one inbound frame bound for the same session are delivered
//! as one array frame, and a session matched by several specs receives each
//! envelope once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{SessionHandler, UpstreamPort, UpstreamTarget};
use crate::domain::streaming::EventClass;
use crate::domain::subscription::{
    RegistryStats, SessionId, SubscriptionChanges, SubscriptionRegistry, SubscriptionSpec,
};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{Frame, FrameCodec};
use crate::infrastructure::server::OutboundQueue;
use crate::infrastructure::upstream::LinkEvent;

const TIER: &str = "router";

/// Registry plus the delivery queue of every authenticated session.
#[derive(Default)]
struct RouterState {
    registry: SubscriptionRegistry,
    sessions: HashMap<SessionId, OutboundQueue>,
}

/// Result of routing one inbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Envelopes in the frame.
    pub envelopes: usize,
    /// Envelopes matched by at least one session.
    pub matched: usize,
    /// Frames queued to sessions.
    pub deliveries: usize,
    /// Envelopes without a usable routing key.
    pub malformed: usize,
}

/// Session handler and frame router for the router tier.
pub struct RouterService {
    state: RwLock<RouterState>,
    upstream: Arc<dyn UpstreamPort>,
    codec: FrameCodec,
}

impl RouterService {
    /// Router publishing desired upstream sets to `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamPort>) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            upstream,
            codec: FrameCodec::new(),
        }
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.state.read().registry.stats()
    }

    /// Specs a session currently holds.
    #[must_use]
    pub fn specs_for(&self, session: SessionId) -> Vec<SubscriptionSpec> {
        self.state.read().registry.specs_for(session)
    }

    fn apply(&self, changes: &SubscriptionChanges) {
        if let Some(non_bar) = &changes.non_bar {
            tracing::info!(tier = TIER, link = "ticks", count = non_bar.len(), "Upstream subscription changed");
            self.upstream.request_subscription(UpstreamTarget::Ticks, non_bar);
        }
        if let Some(bar) = &changes.bar {
            tracing::info!(tier = TIER, link = "bars", count = bar.len(), "Upstream subscription changed");
            self.upstream.request_subscription(UpstreamTarget::Bars, bar);
        }
    }

    /// Route one inbound frame from `source`.
    ///
    /// Envelopes of classes the other link carries are ignored, so a class
    /// relayed by both tiers is never delivered twice.
    pub fn route_frame(&self, source: UpstreamTarget, text: &str) -> RouteOutcome {
        let started = Instant::now();
        let mut outcome = RouteOutcome::default();

        let envelopes = match self.codec.split(text) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::debug!(tier = TIER, error = %e, "Undecodable upstream frame dropped");
                metrics::record_malformed(TIER, e.kind());
                return outcome;
            }
        };
        outcome.envelopes = envelopes.len();

        let state = self.state.read();
        let mut batches: HashMap<SessionId, Vec<&str>> = HashMap::new();
        let mut seen: HashSet<SessionId> = HashSet::new();

        for envelope in &envelopes {
            let key = match self.codec.routing_key(envelope) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!(tier = TIER, error = %e, "Unroutable envelope dropped");
                    metrics::record_malformed(TIER, e.kind());
                    outcome.malformed += 1;
                    continue;
                }
            };
            if !carries(source, key.class) {
                continue;
            }

            seen.clear();
            for session in state.registry.recipients(key) {
                if seen.insert(session) {
                    batches.entry(session).or_default().push(envelope.get());
                }
            }
            if !seen.is_empty() {
                outcome.matched += 1;
            }
        }

        for (session, batch) in batches {
            let Some(queue) = state.sessions.get(&session) else {
                continue;
            };
            queue.push(Frame::from(self.codec.join(batch)));
            outcome.deliveries += 1;
        }
        drop(state);

        if outcome.deliveries > 0 {
            metrics::record_frames_forwarded(TIER, u64::try_from(outcome.deliveries).unwrap_or(u64::MAX));
        }
        metrics::record_routing_duration(source_label(source), started.elapsed());
        outcome
    }

    /// Route frames from one link until it stops or `cancel` fires.
    pub async fn run_link(
        self: Arc<Self>,
        source: UpstreamTarget,
        mut events: mpsc::Receiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        let link = source_label(source);
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                LinkEvent::Frame(frame) => {
                    self.route_frame(source, &frame);
                }
                LinkEvent::Connected => tracing::info!(link, "Upstream link connected"),
                LinkEvent::Subscribed { count } => tracing::info!(link, count, "Upstream subscriptions reconciled"),
                LinkEvent::Disconnected => tracing::warn!(link, "Upstream link disconnected"),
                LinkEvent::Reconnecting { attempt } => tracing::info!(link, attempt, "Upstream link reconnecting"),
                LinkEvent::Error(message) => tracing::error!(link, error = %message, "Upstream link error"),
            }
        }
    }
}

/// Whether `source` is the link that delivers `class`.
const fn carries(source: UpstreamTarget, class: EventClass) -> bool {
    match source {
        UpstreamTarget::Ticks => !class.is_bar(),
        UpstreamTarget::Bars => class.is_bar(),
    }
}

const fn source_label(source: UpstreamTarget) -> &'static str {
    match source {
        UpstreamTarget::Ticks => "ticks",
        UpstreamTarget::Bars => "bars",
    }
}

#[async_trait]
impl SessionHandler for RouterService {
    async fn on_authenticated(&self, session: SessionId, queue: OutboundQueue) {
        self.state.write().sessions.insert(session, queue);
    }

    async fn on_subscribe(&self, session: SessionId, specs: &[SubscriptionSpec]) {
        let mut state = self.state.write();
        let changes = state.registry.subscribe(session, specs);
        self.apply(&changes);
    }

    async fn on_unsubscribe(&self, session: SessionId, specs: &[SubscriptionSpec]) {
        let mut state = self.state.write();
        let changes = state.registry.unsubscribe(session, specs);
        self.apply(&changes);
    }

    async fn on_closed(&self, session: SessionId) {
        let mut state = self.state.write();
        state.sessions.remove(&session);
        let changes = state.registry.remove_session(session);
        self.apply(&changes);
        tracing::debug!(tier = TIER, session_id = session, "Session removed from registry");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::MockUpstreamPort;
    use crate::domain::subscription::parse_spec_list;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn lenient_upstream() -> Arc<dyn UpstreamPort> {
        let mut mock = MockUpstreamPort::new();
        mock.expect_request_subscription().return_const(());
        Arc::new(mock)
    }

    async fn attach(router: &RouterService, session: SessionId) -> mpsc::Receiver<Frame> {
        let (queue, rx) = OutboundQueue::new(session, TIER, 64, CancellationToken::new());
        router.on_authenticated(session, queue).await;
        rx
    }

    async fn subscribe(router: &RouterService, session: SessionId, params: &str) {
        router.on_subscribe(session, &parse_spec_list(params).accepted).await;
    }

    #[tokio::test]
    async fn subscribe_requests_minimal_sets() {
        let mut mock = MockUpstreamPort::new();
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Ticks), eq(set(&["T.AAPL"])))
            .times(1)
            .return_const(());
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Bars), eq(set(&["500Ms.AAPL", "A.AAPL"])))
            .times(1)
            .return_const(());

        let router = RouterService::new(Arc::new(mock));
        subscribe(&router, 1, "T.AAPL,A.AAPL,500Ms.AAPL").await;
        // Overlap and repeats leave the upstream untouched.
        subscribe(&router, 2, "T.AAPL").await;
        subscribe(&router, 1, "T.AAPL").await;
    }

    #[tokio::test]
    async fn wildcard_requests_fixed_sets_without_millisecond_bars() {
        let mut mock = MockUpstreamPort::new();
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Ticks), eq(set(&["FMV.*", "LULD.*", "Q.*", "T.*"])))
            .times(1)
            .return_const(());
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Bars), eq(set(&["A.*", "AM.*"])))
            .times(1)
            .return_const(());

        let router = RouterService::new(Arc::new(mock));
        subscribe(&router, 1, "*").await;
    }

    #[tokio::test]
    async fn last_holder_leaving_shrinks_upstream() {
        let mut mock = MockUpstreamPort::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Ticks), eq(set(&["T.AAPL", "T.MSFT"])))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock.expect_request_subscription()
            .with(eq(UpstreamTarget::Ticks), eq(set(&["T.AAPL"])))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let router = RouterService::new(Arc::new(mock));
        let _rx1 = attach(&router, 1).await;
        let _rx2 = attach(&router, 2).await;
        subscribe(&router, 1, "T.AAPL,T.MSFT").await;
        subscribe(&router, 2, "T.AAPL").await;
        router.on_closed(1).await;

        assert!(router.specs_for(1).is_empty());
        assert_eq!(router.stats().session_count, 1);
    }

    #[tokio::test]
    async fn empty_params_change_nothing() {
        let mut mock = MockUpstreamPort::new();
        mock.expect_request_subscription().never();

        let router = RouterService::new(Arc::new(mock));
        subscribe(&router, 1, "").await;
        assert_eq!(router.stats().spec_count, 0);
    }

    #[tokio::test]
    async fn routes_only_to_matching_sessions() {
        let router = RouterService::new(lenient_upstream());
        let mut aapl = attach(&router, 1).await;
        let mut msft = attach(&router, 2).await;
        subscribe(&router, 1, "T.AAPL").await;
        subscribe(&router, 2, "T.MSFT,Q.AAPL").await;

        let frame = r#"[{"ev":"T","sym":"AAPL","p":1,"s":1,"t":1},{"ev":"T","sym":"MSFT","p":2,"s":1,"t":1}]"#;
        let outcome = router.route_frame(UpstreamTarget::Ticks, frame);
        assert_eq!(outcome.envelopes, 2);
        assert_eq!(outcome.deliveries, 2);

        assert_eq!(
            aapl.try_recv().unwrap().as_str(),
            r#"[{"ev":"T","sym":"AAPL","p":1,"s":1,"t":1}]"#
        );
        assert_eq!(
            msft.try_recv().unwrap().as_str(),
            r#"[{"ev":"T","sym":"MSFT","p":2,"s":1,"t":1}]"#
        );
        assert!(aapl.try_recv().is_err());
        assert!(msft.try_recv().is_err());
    }

    #[tokio::test]
    async fn overlapping_matches_deliver_once() {
        let router = RouterService::new(lenient_upstream());
        let mut rx = attach(&router, 1).await;
        subscribe(&router, 1, "T.AAPL,T.*,*").await;

        router.route_frame(UpstreamTarget::Ticks, r#"{"ev":"T","sym":"AAPL","p":1,"s":1,"t":1}"#);
        let frame = rx.try_recv().unwrap();
        let items: Vec<serde_json::Value> = serde_json::from_str(&frame).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_never_receives_millisecond_bars() {
        let router = RouterService::new(lenient_upstream());
        let mut wildcard = attach(&router, 1).await;
        let mut explicit = attach(&router, 2).await;
        subscribe(&router, 1, "*").await;
        subscribe(&router, 2, "*,500Ms.AAPL").await;

        let bar = r#"{"T":"b","interval":500,"S":"AAPL","o":1,"h":1,"l":1,"c":1,"v":1,"n":1,"s":0,"e":500}"#;
        let outcome = router.route_frame(UpstreamTarget::Bars, bar);
        assert_eq!(outcome.deliveries, 1);
        assert!(wildcard.try_recv().is_err());
        assert_eq!(explicit.try_recv().unwrap().as_str(), format!("[{bar}]"));

        router.route_frame(UpstreamTarget::Bars, r#"[{"ev":"AM","sym":"AAPL"}]"#);
        assert!(wildcard.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bar_classes_ignored_on_ticks_link() {
        let router = RouterService::new(lenient_upstream());
        let mut rx = attach(&router, 1).await;
        subscribe(&router, 1, "A.AAPL").await;

        let native = r#"[{"ev":"A","sym":"AAPL"}]"#;
        assert_eq!(router.route_frame(UpstreamTarget::Ticks, native).deliveries, 0);
        assert_eq!(router.route_frame(UpstreamTarget::Bars, native).deliveries, 1);
        assert_eq!(rx.try_recv().unwrap().as_str(), native);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_skipped() {
        let router = RouterService::new(lenient_upstream());
        let mut rx = attach(&router, 1).await;
        subscribe(&router, 1, "T.AAPL").await;

        let frame = r#"[{"ev":"ZZ","sym":"AAPL"},{"ev":"T"},{"ev":"T","sym":"AAPL"}]"#;
        let outcome = router.route_frame(UpstreamTarget::Ticks, frame);
        assert_eq!(outcome.malformed, 2);
        assert_eq!(outcome.matched, 1);
        assert_eq!(rx.try_recv().unwrap().as_str(), r#"[{"ev":"T","sym":"AAPL"}]"#);

        assert_eq!(router.route_frame(UpstreamTarget::Ticks, "garbage"), RouteOutcome::default());
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_registry() {
        let router = RouterService::new(lenient_upstream());
        subscribe(&router, 1, "T.AAPL").await;
        router
            .on_unsubscribe(1, &parse_spec_list("T.AAPL,Q.NEVER").accepted)
            .await;
        assert_eq!(router.stats(), RegistryStats::default());
    }
}
