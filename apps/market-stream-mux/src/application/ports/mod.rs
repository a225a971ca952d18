//! Port Interfaces
//!
//! Contracts between the tier services and the infrastructure adapters.
//!
//! ## Driver Ports (Inbound)
//!
//! - `SessionHandler`: what a tier does when a client session authenticates,
//!   changes its subscriptions, or goes away. Implemented by each tier
//!   service, driven by the WebSocket server.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamPort`: where the router publishes the minimal subscription sets
//!   its upstream links must hold.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::subscription::{SessionId, SubscriptionSpec};
use crate::infrastructure::server::OutboundQueue;

/// Tier behavior behind a client session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The session presented a valid token; `queue` delivers to it.
    async fn on_authenticated(&self, session: SessionId, queue: OutboundQueue);

    /// The session asked for `specs` (already parsed, invalid ones dropped).
    async fn on_subscribe(&self, session: SessionId, specs: &[SubscriptionSpec]);

    /// The session dropped `specs`.
    async fn on_unsubscribe(&self, session: SessionId, specs: &[SubscriptionSpec]);

    /// The session is gone.
    async fn on_closed(&self, session: SessionId);
}

/// Which upstream link a subscription set is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamTarget {
    /// Ingress tier: trades, quotes, LULD, FMV.
    Ticks,
    /// Bar-synthesis tier: native and millisecond bars.
    Bars,
}

/// Sink for desired upstream subscription sets.
///
/// Called while the registry write lock is held, so implementations must not
/// block.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamPort: Send + Sync {
    /// Replace the desired subscription set of one link.
    fn request_subscription(&self, target: UpstreamTarget, specs: &BTreeSet<String>);
}
