//! Bar-Synthesis Tier Binary
//!
//! Subscribes to the ingress firehose for trades and native bars, builds
//! millisecond bars for the `<N>Ms.<SYMBOL>` specs its clients hold, and
//! rebroadcasts native plus synthesized bars.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bar-synth
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_AUTH_TOKEN`: Token shared with the ingress tier and clients
//!
//! ## Optional
//! - `INGRESS_URL`: Ingress tier URL (default: <ws://127.0.0.1:8765>)
//! - `BAR_SYNTH_UPSTREAM_PARAMS`: Subscription sent to ingress (default: T.*,A.*,AM.*)
//! - `BAR_SYNTH_PORT` / `BAR_SYNTH_HEALTH_PORT`: Listen ports (default: 8766 / 8083)
//! - `BROADCAST_CAPACITY`: Frames buffered per client (default: 16384)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `RUST_LOG`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_mux::infrastructure::runtime;
use market_stream_mux::infrastructure::upstream::desired;
use market_stream_mux::{
    BarEngine, BarSynthConfig, BarSynthService, FrameHub, HealthServer, HealthServerState,
    LinkConfig, LinkRole, StreamServer, TokenAuthenticator, UpstreamLink, init_metrics,
    init_telemetry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TIER: &str = "bar_synth";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Ingress frames buffered ahead of the engine.
const LINK_EVENT_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::install_crypto_provider();
    runtime::load_dotenv();

    let _telemetry_guard = init_telemetry("bar-synth");
    let _metrics_handle = init_metrics();

    let config = BarSynthConfig::from_env().context("loading bar-synth configuration")?;
    tracing::info!(
        ingress_url = %config.ingress_url,
        params = %config.upstream_params,
        port = config.server.port,
        health_port = config.server.health_port,
        "Starting bar-synthesis tier"
    );

    let shutdown = CancellationToken::new();
    let hub = FrameHub::new(config.broadcast_capacity);
    let service = Arc::new(BarSynthService::new(hub.clone()));

    let (_desired_tx, desired_rx) = desired::fixed(&config.upstream_params);
    let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
    let link = UpstreamLink::new(
        LinkConfig::new(
            LinkRole::Ingress,
            config.ingress_url.clone(),
            config.auth_token.clone(),
            &config.link,
        ),
        desired_rx,
        event_tx,
        shutdown.clone(),
    );
    let link_state = link.state();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let server = StreamServer::bind(
        addr,
        TIER,
        service.clone(),
        TokenAuthenticator::new(config.auth_token.clone()),
        config.server.client_queue_capacity,
        shutdown.clone(),
    )
    .await
    .context("binding bar-synth listener")?;

    let health_state = Arc::new(HealthServerState::new(
        TIER,
        env!("CARGO_PKG_VERSION").to_string(),
        vec![link_state],
        server.session_counter(),
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, shutdown.clone());

    let engine = BarEngine::new(hub);
    let engine_task = tokio::spawn(engine.run(event_rx, service.interest(), shutdown.clone()));

    let link_task = tokio::spawn(async move {
        if let Err(e) = link.run().await {
            tracing::error!(error = %e, "Ingress link stopped");
        }
    });

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(addr = %addr, "Bar-synthesis tier ready");
    let server_task = tokio::spawn(server.run());

    runtime::await_shutdown(shutdown).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = server_task.await;
        let _ = link_task.await;
        let _ = engine_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Shutdown timed out");
    }

    tracing::info!("Bar-synthesis tier stopped");
    Ok(())
}
