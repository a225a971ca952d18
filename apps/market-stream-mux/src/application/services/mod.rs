//! Application Services
//!
//! One service per tier, each implementing
//! [`SessionHandler`](crate::application::ports::SessionHandler):
//!
//! - `FirehoseService`: ingress tier, unfiltered rebroadcast
//! - `BarSynthService` / `BarEngine`: bar-synthesis tier
//! - `RouterService`: subscription router

pub mod bar_synth;
pub mod firehose;
pub mod router;

pub use bar_synth::{BarEngine, BarSynthService};
pub use firehose::{FirehoseService, relay_link_events};
pub use router::{RouteOutcome, RouterService};
