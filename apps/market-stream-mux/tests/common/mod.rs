//! Shared helpers for the pipeline integration tests.
//!
//! [`FakeUpstream`] plays the vendor (or any upstream tier): it greets,
//! checks the token, tracks the subscription the link asked for, and pushes
//! frames on demand. The client helpers drive a tier the way an external
//! consumer would.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_stream_mux::LinkSettings;
use market_stream_mux::infrastructure::upstream::LinkState;
use market_stream_mux::infrastructure::upstream::state::LinkStatus;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(2);

/// Token shared by every tier and client in the tests.
pub const TOKEN: &str = "test-token";

/// Link settings with short reconnect delays.
#[must_use]
pub fn fast_link_settings() -> LinkSettings {
    LinkSettings {
        reconnect_delay_initial: Duration::from_millis(20),
        reconnect_delay_max: Duration::from_millis(100),
        ..LinkSettings::default()
    }
}

// =============================================================================
// Fake Upstream
// =============================================================================

#[derive(Debug, Clone)]
enum Control {
    Frame(String),
    Drop,
}

/// Scriptable upstream WebSocket endpoint.
pub struct FakeUpstream {
    addr: SocketAddr,
    control: broadcast::Sender<Control>,
    subscriptions: watch::Receiver<BTreeSet<String>>,
    connections: watch::Receiver<usize>,
}

impl FakeUpstream {
    /// Listen on an ephemeral port, accepting `token`.
    pub async fn start(token: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (control, _) = broadcast::channel(256);
        let (subs_tx, subscriptions) = watch::channel(BTreeSet::new());
        let (conns_tx, connections) = watch::channel(0usize);
        let subs_tx = Arc::new(subs_tx);
        let conns_tx = Arc::new(conns_tx);

        let accept_control = control.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    stream,
                    token,
                    accept_control.subscribe(),
                    Arc::clone(&subs_tx),
                    Arc::clone(&conns_tx),
                ));
            }
        });

        Self {
            addr,
            control,
            subscriptions,
            connections,
        }
    }

    /// WebSocket URL of this upstream.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a data frame to every authenticated connection.
    pub fn push(&self, frame: &str) {
        let _ = self.control.send(Control::Frame(frame.to_string()));
    }

    /// Drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Wait until the latest connection's subscription equals `expected`.
    pub async fn wait_subscriptions(&self, expected: &[&str]) {
        let expected: BTreeSet<String> = expected.iter().map(ToString::to_string).collect();
        let mut rx = self.subscriptions.clone();
        let reached = timeout(WAIT, rx.wait_for(|current| *current == expected))
            .await
            .is_ok_and(|changed| changed.is_ok());
        assert!(
            reached,
            "upstream subscription never reached {expected:?}, last {:?}",
            *self.subscriptions.borrow()
        );
    }

    /// Current subscription of the latest connection.
    #[must_use]
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.borrow().clone()
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_connections(&self, count: usize) {
        let mut rx = self.connections.clone();
        timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("upstream connection count timed out")
            .expect("upstream stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    token: &'static str,
    mut control: broadcast::Receiver<Control>,
    subscriptions: Arc<watch::Sender<BTreeSet<String>>>,
    connections: Arc<watch::Sender<usize>>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    subscriptions.send_replace(BTreeSet::new());
    connections.send_modify(|n| *n += 1);

    let greeting = json!([{"ev": "status", "status": "connected", "message": "connected"}]);
    if ws.send(Message::text(greeting.to_string())).await.is_err() {
        return;
    }

    let mut authenticated = false;
    loop {
        tokio::select! {
            message = ws.next() => {
                let Some(Ok(message)) = message else { break };
                let Message::Text(text) = message else { continue };
                let Ok(command) = serde_json::from_str::<Value>(&text) else { continue };
                let action = command["action"].as_str().unwrap_or_default();
                let params = command["params"].as_str().unwrap_or_default();
                let specs = params.split(',').map(str::trim).filter(|s| !s.is_empty());

                let reply = match action {
                    "auth" if params == token => {
                        authenticated = true;
                        json!([{"ev": "status", "status": "auth_success"}])
                    }
                    "auth" => json!([{"ev": "status", "status": "auth_failed"}]),
                    "subscribe" if authenticated => {
                        subscriptions.send_modify(|s| s.extend(specs.map(ToString::to_string)));
                        json!([{"ev": "status", "status": "success", "message": format!("subscribed to {params}")}])
                    }
                    "unsubscribe" if authenticated => {
                        let specs: Vec<&str> = specs.collect();
                        subscriptions.send_modify(|s| s.retain(|held| !specs.contains(&held.as_str())));
                        json!([{"ev": "status", "status": "success", "message": format!("unsubscribed from {params}")}])
                    }
                    _ => continue,
                };
                if ws.send(Message::text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            control = control.recv() => match control {
                Ok(Control::Frame(frame)) if authenticated => {
                    if ws.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Frame(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Wait until a link reports it is streaming.
pub async fn wait_streaming(state: &LinkState) {
    let result = timeout(WAIT, async {
        while state.status() != LinkStatus::Streaming {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "link never reached streaming, status {:?}", state.status());
}

// =============================================================================
// Client Helpers
// =============================================================================

/// Client side of a tier connection.
pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a connection and consume the greeting.
pub async fn connect(addr: SocketAddr) -> Client {
    let (mut client, _) = timeout(WAIT, connect_async(format!("ws://{addr}")))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let greeting = recv_json(&mut client).await;
    assert_eq!(greeting["status"], "connected");
    client
}

/// Connect and authenticate with [`TOKEN`].
pub async fn login(addr: SocketAddr) -> Client {
    let mut client = connect(addr).await;
    let reply = command(&mut client, "auth", TOKEN).await;
    assert_eq!(reply["status"], "auth_success");
    client
}

/// Send raw text.
pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::text(text.to_string())).await.unwrap();
}

/// Send an action and return the next reply.
pub async fn command(client: &mut Client, action: &str, params: &str) -> Value {
    send_text(client, &json!({"action": action, "params": params}).to_string()).await;
    recv_json(client).await
}

/// Next text frame, skipping control messages.
pub async fn recv_text(client: &mut Client) -> String {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text.to_string();
        }
    }
}

/// Next text frame parsed as JSON.
pub async fn recv_json(client: &mut Client) -> Value {
    let text = recv_text(client).await;
    serde_json::from_str(&text).unwrap()
}

/// Assert nothing but control messages arrives within `window`.
pub async fn assert_quiet(client: &mut Client, window: Duration) {
    let outcome = timeout(window, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = outcome {
        panic!("unexpected frame: {text}");
    }
}

/// Build a trade envelope.
#[must_use]
pub fn trade(symbol: &str, price: f64, size: u64, ts: i64) -> String {
    json!({"ev": "T", "sym": symbol, "p": price, "s": size, "t": ts}).to_string()
}

/// Wrap envelopes into one array frame.
#[must_use]
pub fn frame(envelopes: &[String]) -> String {
    format!("[{}]", envelopes.join(","))
}
