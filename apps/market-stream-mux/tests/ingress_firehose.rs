//! Ingress Firehose Integration Tests
//!
//! The ingress tier relays vendor frames verbatim to every authenticated
//! client and keeps its fixed vendor subscription across reconnects.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use market_stream_mux::application::services::relay_link_events;
use market_stream_mux::infrastructure::upstream::desired;
use market_stream_mux::{
    FirehoseService, FrameHub, LinkConfig, LinkRole, Secret, StreamServer, TokenAuthenticator,
    UpstreamLink,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{
    FakeUpstream, TOKEN, assert_quiet, command, connect, fast_link_settings, frame, login,
    recv_text, trade,
};

const VENDOR_KEY: &str = "vendor-key";

struct IngressHarness {
    addr: std::net::SocketAddr,
    vendor: FakeUpstream,
    cancel: CancellationToken,
}

impl Drop for IngressHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_ingress() -> IngressHarness {
    let vendor = FakeUpstream::start(VENDOR_KEY).await;
    let cancel = CancellationToken::new();
    let hub = FrameHub::new(256);

    let (desired_tx, desired_rx) = desired::fixed("T.*, Q.*");
    let (event_tx, event_rx) = mpsc::channel(256);
    let link = UpstreamLink::new(
        LinkConfig::new(
            LinkRole::Vendor,
            vendor.url(),
            Secret::new(VENDOR_KEY),
            &fast_link_settings(),
        ),
        desired_rx,
        event_tx,
        cancel.clone(),
    );
    tokio::spawn(relay_link_events(event_rx, hub.clone(), "ingress", cancel.clone()));
    tokio::spawn(async move {
        let _keep = desired_tx;
        let _ = link.run().await;
    });

    let server = StreamServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        "ingress",
        Arc::new(FirehoseService::new(hub, "ingress")),
        TokenAuthenticator::new(Secret::new(TOKEN)),
        64,
        cancel.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    vendor.wait_subscriptions(&["Q.*", "T.*"]).await;

    IngressHarness {
        addr,
        vendor,
        cancel,
    }
}

#[tokio::test]
async fn test_frames_relayed_verbatim_to_every_client() {
    let harness = start_ingress().await;
    let mut first = login(harness.addr).await;
    let mut second = login(harness.addr).await;

    // Subscriptions are acknowledged but do not filter the firehose.
    let reply = command(&mut first, "subscribe", "T.AAPL").await;
    assert_eq!(reply["status"], "success");

    let raw = frame(&[trade("MSFT", 410.25, 7, 1000), trade("AAPL", 150.5, 3, 1001)]);
    harness.vendor.push(&raw);

    assert_eq!(recv_text(&mut first).await, raw);
    assert_eq!(recv_text(&mut second).await, raw);
}

#[tokio::test]
async fn test_unauthenticated_client_receives_nothing() {
    let harness = start_ingress().await;
    let mut anonymous = connect(harness.addr).await;

    let reply = command(&mut anonymous, "auth", "nope").await;
    assert_eq!(reply["status"], "auth_failed");

    harness.vendor.push(&frame(&[trade("AAPL", 1.0, 1, 1)]));
    assert_quiet(&mut anonymous, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_vendor_reconnect_reissues_fixed_subscription() {
    let harness = start_ingress().await;
    let mut client = login(harness.addr).await;

    harness.vendor.drop_connections();
    harness.vendor.wait_connections(2).await;
    harness.vendor.wait_subscriptions(&["Q.*", "T.*"]).await;

    let raw = frame(&[trade("AAPL", 2.0, 1, 2)]);
    harness.vendor.push(&raw);
    assert_eq!(recv_text(&mut client).await, raw);
}
