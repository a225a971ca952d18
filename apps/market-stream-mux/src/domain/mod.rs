//! Domain Layer - Core streaming types and business logic.
//!
//! Pure types with no I/O: envelopes and event classes, the subscription
//! grammar and registry, and the millisecond bar aggregator.

/// Market data envelopes and event classes.
pub mod streaming;

/// Subscription specs and the session registry.
pub mod subscription;

/// Millisecond bar synthesis.
pub mod aggregation;
