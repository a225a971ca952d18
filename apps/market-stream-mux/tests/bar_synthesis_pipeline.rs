//! Bar Synthesis Integration Tests
//!
//! A fake ingress feeds trades into the bar-synthesis tier; clients see
//! millisecond bars directly on that tier and through the router.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use market_stream_mux::infrastructure::upstream::desired;
use market_stream_mux::{
    BarEngine, BarSynthService, DesiredSubscriptions, FrameHub, LinkConfig, LinkRole,
    RouterService, Secret, StreamServer, TokenAuthenticator, UpstreamLink, UpstreamTarget,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{
    FakeUpstream, TOKEN, WAIT, assert_quiet, command, fast_link_settings, frame, login,
    recv_json, trade, wait_streaming,
};

struct BarTier {
    addr: std::net::SocketAddr,
    ingress: FakeUpstream,
    service: Arc<BarSynthService>,
    cancel: CancellationToken,
}

impl Drop for BarTier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_bar_tier() -> BarTier {
    let ingress = FakeUpstream::start(TOKEN).await;
    let cancel = CancellationToken::new();
    let hub = FrameHub::new(256);
    let service = Arc::new(BarSynthService::new(hub.clone()));

    let (desired_tx, desired_rx) = desired::fixed("T.*,A.*,AM.*");
    let (event_tx, event_rx) = mpsc::channel(256);
    let link = UpstreamLink::new(
        LinkConfig::new(
            LinkRole::Ingress,
            ingress.url(),
            Secret::new(TOKEN),
            &fast_link_settings(),
        ),
        desired_rx,
        event_tx,
        cancel.clone(),
    );
    tokio::spawn(BarEngine::new(hub).run(event_rx, service.interest(), cancel.clone()));
    tokio::spawn(async move {
        let _keep = desired_tx;
        let _ = link.run().await;
    });

    let server = StreamServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        "bar_synth",
        service.clone(),
        TokenAuthenticator::new(Secret::new(TOKEN)),
        64,
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    ingress.wait_subscriptions(&["A.*", "AM.*", "T.*"]).await;

    BarTier {
        addr,
        ingress,
        service,
        cancel,
    }
}

impl BarTier {
    async fn wait_interest(&self, symbol: &str, interval: u64) {
        let mut interest = self.service.interest();
        timeout(WAIT, interest.wait_for(|current| current.wants(symbol, interval)))
            .await
            .expect("bar interest never arrived")
            .expect("bar service dropped");
        // Let the engine observe the change before trades flow.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn push_trades(&self) {
        for (price, size, ts) in [(10.0, 100, 1000), (11.0, 50, 1300), (9.5, 20, 1450)] {
            self.ingress.push(&frame(&[trade("AAPL", price, size, ts)]));
        }
        // First trade of the next bucket closes the 1000..1500 bar.
        self.ingress.push(&frame(&[trade("AAPL", 10.5, 10, 1550)]));
    }
}

fn assert_first_bar(bar: &Value) {
    assert_eq!(bar["T"], "b");
    assert_eq!(bar["S"], "AAPL");
    assert_eq!(bar["interval"], 500);
    assert_eq!(bar["s"], 1000);
    assert_eq!(bar["e"], 1500);
    assert_eq!(bar["o"].as_f64(), Some(10.0));
    assert_eq!(bar["h"].as_f64(), Some(11.0));
    assert_eq!(bar["l"].as_f64(), Some(9.5));
    assert_eq!(bar["c"].as_f64(), Some(9.5));
    assert_eq!(bar["v"], 170);
    assert_eq!(bar["n"], 3);
}

#[tokio::test]
async fn test_bar_tier_emits_millisecond_bar_on_bucket_roll() {
    let tier = start_bar_tier().await;
    let mut client = login(tier.addr).await;

    let reply = command(&mut client, "subscribe", "500Ms.AAPL").await;
    assert_eq!(reply["message"], "subscribed to 500Ms.AAPL");
    tier.wait_interest("AAPL", 500).await;

    tier.push_trades();

    let got = recv_json(&mut client).await;
    assert_eq!(got.as_array().unwrap().len(), 1);
    assert_first_bar(&got[0]);
}

#[tokio::test]
async fn test_bar_tier_relays_native_bars() {
    let tier = start_bar_tier().await;
    let mut client = login(tier.addr).await;

    let native = r#"{"ev":"AM","sym":"MSFT","o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":900,"s":0,"e":60000}"#;
    tier.ingress.push(&frame(&[native.to_string()]));

    let got = recv_json(&mut client).await;
    assert_eq!(got[0]["ev"], "AM");
    assert_eq!(got[0]["v"], 900);
}

/// Router whose bars link points at `tier`; the ticks link idles on a fake.
async fn start_router(tier: &BarTier) -> (std::net::SocketAddr, FakeUpstream) {
    let ticks = FakeUpstream::start(TOKEN).await;
    let cancel = tier.cancel.child_token();

    let desired = Arc::new(DesiredSubscriptions::new());
    let router = Arc::new(RouterService::new(desired.clone()));
    let mut states = Vec::new();
    for (target, role, url) in [
        (UpstreamTarget::Ticks, LinkRole::Ticks, ticks.url()),
        (UpstreamTarget::Bars, LinkRole::Bars, format!("ws://{}", tier.addr)),
    ] {
        let (event_tx, event_rx) = mpsc::channel(256);
        let link = UpstreamLink::new(
            LinkConfig::new(role, url, Secret::new(TOKEN), &fast_link_settings()),
            desired.subscribe(target),
            event_tx,
            cancel.clone(),
        );
        states.push(link.state());
        tokio::spawn(Arc::clone(&router).run_link(target, event_rx, cancel.clone()));
        tokio::spawn(async move {
            let _ = link.run().await;
        });
    }

    let server = StreamServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        "router",
        router,
        TokenAuthenticator::new(Secret::new(TOKEN)),
        64,
        cancel,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    for state in &states {
        wait_streaming(state).await;
    }

    (addr, ticks)
}

#[tokio::test]
async fn test_router_delivers_synthesized_bars_to_holders_only() {
    let tier = start_bar_tier().await;
    let (router_addr, _ticks) = start_router(&tier).await;

    let mut holder = login(router_addr).await;
    let mut wildcard = login(router_addr).await;
    command(&mut holder, "subscribe", "500Ms.AAPL").await;
    command(&mut wildcard, "subscribe", "*").await;
    tier.wait_interest("AAPL", 500).await;

    tier.push_trades();

    let got = recv_json(&mut holder).await;
    assert_eq!(got.as_array().unwrap().len(), 1);
    assert_first_bar(&got[0]);

    assert_quiet(&mut wildcard, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_open_bar_survives_covering_wildcard_subscription() {
    let tier = start_bar_tier().await;
    let (router_addr, _ticks) = start_router(&tier).await;

    let mut holder = login(router_addr).await;
    command(&mut holder, "subscribe", "500Ms.AAPL").await;
    tier.wait_interest("AAPL", 500).await;

    tier.ingress.push(&frame(&[trade("AAPL", 10.0, 100, 1000)]));
    tier.ingress.push(&frame(&[trade("AAPL", 11.0, 50, 1300)]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The router now asks the bar tier for 500Ms.* in place of 500Ms.AAPL.
    let mut widening = login(router_addr).await;
    command(&mut widening, "subscribe", "500Ms.*").await;
    let mut interest = tier.service.interest();
    timeout(
        WAIT,
        interest.wait_for(|current| current.len() == 1 && current.wants("MSFT", 500)),
    )
    .await
    .expect("wildcard interest never settled")
    .expect("bar service dropped");
    tokio::time::sleep(Duration::from_millis(50)).await;

    tier.ingress.push(&frame(&[trade("AAPL", 9.5, 20, 1450)]));
    tier.ingress.push(&frame(&[trade("AAPL", 10.5, 10, 1550)]));

    let got = recv_json(&mut holder).await;
    assert_eq!(got.as_array().unwrap().len(), 1);
    assert_first_bar(&got[0]);

    let got = recv_json(&mut widening).await;
    assert_first_bar(&got[0]);
}
