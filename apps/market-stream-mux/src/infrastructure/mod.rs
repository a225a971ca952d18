//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Reconnecting WebSocket links to upstream feeds and tiers.
pub mod upstream;

/// Client-facing WebSocket server.
pub mod server;

/// Wire codec and client protocol messages.
pub mod protocol;

/// Broadcast channel for firehose fan-out.
pub mod broadcast;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Process startup and shutdown helpers.
pub mod runtime;

/// OpenTelemetry tracing integration.
pub mod telemetry;
