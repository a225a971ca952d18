//! Prometheus Metrics Module
//!
//! Exposes tier metrics in Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: received per upstream link, forwarded to sessions, malformed
//! - **Sessions**: active sessions, slow clients closed
//! - **Links**: reconnects, upstream subscription counts
//! - **Bars**: synthesized bars emitted, late trades
//! - **Latency**: time to route one inbound frame
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call more than once; later calls return the first handle.
///
/// # Panics
///
/// Panics if another recorder was already installed by a different crate.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_mux_frames_received_total",
        "Data frames received per upstream link"
    );
    describe_counter!(
        "market_mux_frames_forwarded_total",
        "Frames queued to client sessions"
    );
    describe_counter!(
        "market_mux_malformed_frames_total",
        "Inbound frames or envelopes dropped as malformed"
    );
    describe_counter!(
        "market_mux_slow_clients_closed_total",
        "Sessions closed because their outbound queue was full"
    );
    describe_counter!(
        "market_mux_broadcast_lagged_total",
        "Frames skipped by lagging internal clients"
    );
    describe_counter!(
        "market_mux_reconnects_total",
        "Upstream reconnection attempts"
    );
    describe_counter!(
        "market_mux_bars_emitted_total",
        "Synthesized millisecond bars emitted"
    );
    describe_counter!(
        "market_mux_late_trades_total",
        "Trades older than the open bucket, folded into it"
    );

    describe_gauge!("market_mux_active_sessions", "Connected client sessions");
    describe_gauge!(
        "market_mux_upstream_subscriptions",
        "Specs currently subscribed on each upstream link"
    );

    describe_histogram!(
        "market_mux_routing_seconds",
        "Time to route one inbound frame to client queues"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a data frame received on an upstream link.
pub fn record_frame_received(link: &'static str) {
    counter!("market_mux_frames_received_total", "link" => link).increment(1);
}

/// Record frames queued to sessions.
pub fn record_frames_forwarded(tier: &'static str, count: u64) {
    counter!("market_mux_frames_forwarded_total", "tier" => tier).increment(count);
}

/// Record a malformed frame or envelope.
pub fn record_malformed(tier: &'static str, kind: &'static str) {
    counter!(
        "market_mux_malformed_frames_total",
        "tier" => tier,
        "kind" => kind
    )
    .increment(1);
}

/// Record a session closed as a slow consumer.
pub fn record_slow_client(tier: &'static str) {
    counter!("market_mux_slow_clients_closed_total", "tier" => tier).increment(1);
}

/// Record frames an internal client skipped after lagging.
pub fn record_broadcast_lag(tier: &'static str, skipped: u64) {
    counter!("market_mux_broadcast_lagged_total", "tier" => tier).increment(skipped);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(link: &'static str) {
    counter!("market_mux_reconnects_total", "link" => link).increment(1);
}

/// Record synthesized bars emitted.
pub fn record_bars_emitted(count: u64) {
    counter!("market_mux_bars_emitted_total").increment(count);
}

/// Record late trades.
pub fn record_late_trades(count: u64) {
    counter!("market_mux_late_trades_total").increment(count);
}

/// Update the active session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_sessions(tier: &'static str, count: usize) {
    gauge!("market_mux_active_sessions", "tier" => tier).set(count as f64);
}

/// Update the subscription count on an upstream link.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_subscriptions(link: &'static str, count: usize) {
    gauge!("market_mux_upstream_subscriptions", "link" => link).set(count as f64);
}

/// Record routing duration for one inbound frame.
pub fn record_routing_duration(link: &'static str, duration: Duration) {
    histogram!("market_mux_routing_seconds", "link" => link).record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
