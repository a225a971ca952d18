//! Subscription Router Binary
//!
//! Client-facing proxy. Clients authenticate, subscribe with
//! `<CLASS>.<SYMBOL>` / `<N>Ms.<SYMBOL>` / `*` specs, and receive only the
//! envelopes they asked for. The router keeps one link to the ingress tier
//! (trades, quotes, LULD, FMV) and one to the bar-synthesis tier (native
//! and millisecond bars), each subscribed to the minimal set its clients
//! need.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-router
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_AUTH_TOKEN`: Token clients and internal tiers authenticate with
//!
//! ## Optional
//! - `INGRESS_URL`: Ingress tier URL (default: <ws://127.0.0.1:8765>)
//! - `BAR_SYNTH_URL`: Bar-synthesis tier URL (default: <ws://127.0.0.1:8766>)
//! - `ROUTER_PORT` / `ROUTER_HEALTH_PORT`: Listen ports (default: 8767 / 8084)
//! - `CLIENT_QUEUE_CAPACITY`: Frames buffered per client before it is closed (default: 1024)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `RUST_LOG`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_mux::infrastructure::runtime;
use market_stream_mux::{
    DesiredSubscriptions, HealthServer, HealthServerState, LinkConfig, LinkRole, RouterConfig,
    RouterService, StreamServer, TokenAuthenticator, UpstreamLink, UpstreamTarget, init_metrics,
    init_telemetry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TIER: &str = "router";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered between each link and the routing task.
const LINK_EVENT_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::install_crypto_provider();
    runtime::load_dotenv();

    let _telemetry_guard = init_telemetry("stream-router");
    let _metrics_handle = init_metrics();

    let config = RouterConfig::from_env().context("loading router configuration")?;
    tracing::info!(
        ingress_url = %config.ingress_url,
        bar_synth_url = %config.bar_synth_url,
        port = config.server.port,
        health_port = config.server.health_port,
        "Starting subscription router"
    );

    let shutdown = CancellationToken::new();
    let desired = Arc::new(DesiredSubscriptions::new());
    let router = Arc::new(RouterService::new(desired.clone()));

    let mut link_states = Vec::new();
    let mut tasks = Vec::new();
    for (target, role, url) in [
        (UpstreamTarget::Ticks, LinkRole::Ticks, &config.ingress_url),
        (UpstreamTarget::Bars, LinkRole::Bars, &config.bar_synth_url),
    ] {
        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let link = UpstreamLink::new(
            LinkConfig::new(role, url.clone(), config.auth_token.clone(), &config.link),
            desired.subscribe(target),
            event_tx,
            shutdown.clone(),
        );
        link_states.push(link.state());

        tasks.push(tokio::spawn(Arc::clone(&router).run_link(
            target,
            event_rx,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = link.run().await {
                tracing::error!(link = %role, error = %e, "Upstream link stopped");
            }
        }));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let server = StreamServer::bind(
        addr,
        TIER,
        router.clone(),
        TokenAuthenticator::new(config.auth_token.clone()),
        config.server.client_queue_capacity,
        shutdown.clone(),
    )
    .await
    .context("binding router listener")?;

    let health_state = Arc::new(HealthServerState::new(
        TIER,
        env!("CARGO_PKG_VERSION").to_string(),
        link_states,
        server.session_counter(),
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, shutdown.clone());

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(addr = %addr, "Subscription router ready");
    tasks.push(tokio::spawn(server.run()));

    runtime::await_shutdown(shutdown).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Shutdown timed out");
    }

    tracing::info!("Subscription router stopped");
    Ok(())
}
