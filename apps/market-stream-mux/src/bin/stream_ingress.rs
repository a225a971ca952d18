//! Ingress Tier Binary
//!
//! Holds the single vendor connection and rebroadcasts every data frame to
//! internal clients (the bar-synthesis tier and the router).
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-ingress
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `VENDOR_API_KEY`: Vendor API key
//! - `STREAM_AUTH_TOKEN`: Token internal clients authenticate with
//!
//! ## Optional
//! - `VENDOR_STREAM_URL`: Vendor WebSocket URL (default: <wss://socket.polygon.io/stocks>)
//! - `INGRESS_EVENT_CLASSES`: Event classes to subscribe (default: T,Q,A,AM)
//! - `INGRESS_PORT` / `INGRESS_HEALTH_PORT`: Listen ports (default: 8765 / 8082)
//! - `BROADCAST_CAPACITY`: Frames buffered per internal client (default: 16384)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `RUST_LOG`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_mux::application::services::relay_link_events;
use market_stream_mux::infrastructure::runtime;
use market_stream_mux::infrastructure::upstream::desired;
use market_stream_mux::{
    FirehoseService, FrameHub, HealthServer, HealthServerState, IngressConfig, LinkConfig,
    LinkRole, StreamServer, TokenAuthenticator, UpstreamLink, init_metrics, init_telemetry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TIER: &str = "ingress";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Vendor frames buffered between the link and the hub.
const LINK_EVENT_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::install_crypto_provider();
    runtime::load_dotenv();

    let _telemetry_guard = init_telemetry("stream-ingress");
    let _metrics_handle = init_metrics();

    let config = IngressConfig::from_env().context("loading ingress configuration")?;
    tracing::info!(
        vendor_url = %config.vendor_url,
        params = %config.vendor_params,
        port = config.server.port,
        health_port = config.server.health_port,
        "Starting ingress tier"
    );

    let shutdown = CancellationToken::new();
    let hub = FrameHub::new(config.broadcast_capacity);

    // Vendor link with a fixed subscription.
    let (_desired_tx, desired_rx) = desired::fixed(&config.vendor_params);
    let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
    let link = UpstreamLink::new(
        LinkConfig::new(
            LinkRole::Vendor,
            config.vendor_url.clone(),
            config.vendor_key.clone(),
            &config.link,
        ),
        desired_rx,
        event_tx,
        shutdown.clone(),
    );
    let link_state = link.state();

    let service = Arc::new(FirehoseService::new(hub.clone(), TIER));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let server = StreamServer::bind(
        addr,
        TIER,
        service,
        TokenAuthenticator::new(config.auth_token.clone()),
        config.server.client_queue_capacity,
        shutdown.clone(),
    )
    .await
    .context("binding ingress listener")?;

    let health_state = Arc::new(HealthServerState::new(
        TIER,
        env!("CARGO_PKG_VERSION").to_string(),
        vec![link_state],
        server.session_counter(),
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, shutdown.clone());

    tokio::spawn(relay_link_events(event_rx, hub, TIER, shutdown.clone()));

    let link_task = tokio::spawn(async move {
        if let Err(e) = link.run().await {
            tracing::error!(error = %e, "Vendor link stopped");
        }
    });

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(addr = %addr, "Ingress tier ready");
    let server_task = tokio::spawn(server.run());

    runtime::await_shutdown(shutdown).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = server_task.await;
        let _ = link_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Shutdown timed out");
    }

    tracing::info!("Ingress tier stopped");
    Ok(())
}
