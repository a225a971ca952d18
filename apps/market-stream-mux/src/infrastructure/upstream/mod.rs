//! Upstream Links
//!
//! Reconnecting WebSocket clients each tier uses to reach its upstream:
//! the vendor for the ingress tier, the ingress tier for bar synthesis, and
//! both internal tiers for the router.

pub mod auth;
pub mod desired;
pub mod heartbeat;
pub mod link;
pub mod reconnect;
pub mod state;

pub use desired::DesiredSubscriptions;
pub use link::{LinkConfig, LinkError, LinkEvent, UpstreamLink};
pub use state::{LinkRole, LinkSnapshot, LinkState, LinkStatus};
