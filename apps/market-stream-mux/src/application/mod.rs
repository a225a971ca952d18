//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the tier services and the port interfaces that
//! connect them to the WebSocket server and the upstream links.

/// Port interfaces between services and adapters.
pub mod ports;

/// Tier services: firehose, bar synthesis, router.
pub mod services;
