//! Upstream Link
//!
//! One persistent outbound WebSocket to the vendor or to an internal tier.
//!
//! The link owns the connection lifecycle:
//! - Token handshake (see [`super::auth`])
//! - Heartbeat monitoring
//! - Automatic reconnection with capped, jittered backoff
//! - Reconciling the upstream subscription with the desired set
//!
//! The desired set arrives on a `watch` channel. Each (re)connection starts
//! from an empty active set, so the full desired set is re-issued after every
//! reconnect without any client resending. Control frames are consumed
//! here; data frames are forwarded verbatim as [`LinkEvent::Frame`].

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthError, Handshake, HandshakeStep};
use super::heartbeat::{Beat, Heartbeat, HeartbeatConfig};
use super::reconnect::{Backoff, BackoffConfig};
use super::state::{LinkRole, LinkState, LinkStatus};
use crate::domain::subscription::join_set;
use crate::infrastructure::config::{LinkSettings, Secret};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{ClientCommand, CodecError, Frame, FrameCodec};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur on an upstream link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Heartbeat expired.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Link Events
// =============================================================================

/// Events emitted by an upstream link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Connected and authenticated.
    Connected,
    /// Subscription reconciled; `count` specs now active upstream.
    Subscribed {
        /// Active spec count.
        count: usize,
    },
    /// Disconnected from the upstream.
    Disconnected,
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Attempt number.
        attempt: u32,
    },
    /// Data frame, exactly as received.
    Frame(Frame),
    /// Non-fatal upstream error.
    Error(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one upstream link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Role, used for logs and metrics.
    pub role: LinkRole,
    /// WebSocket URL.
    pub url: String,
    /// Token sent in the auth command.
    pub token: Secret,
    /// Reconnection configuration.
    pub backoff: BackoffConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl LinkConfig {
    /// Create a configuration from shared link settings.
    #[must_use]
    pub fn new(role: LinkRole, url: impl Into<String>, token: Secret, settings: &LinkSettings) -> Self {
        Self {
            role,
            url: url.into(),
            token,
            backoff: BackoffConfig::from(settings),
            heartbeat: HeartbeatConfig::from(settings),
        }
    }
}

// =============================================================================
// Link
// =============================================================================

/// Reconnecting upstream WebSocket link.
pub struct UpstreamLink {
    config: LinkConfig,
    codec: FrameCodec,
    desired: watch::Receiver<BTreeSet<String>>,
    event_tx: mpsc::Sender<LinkEvent>,
    state: Arc<LinkState>,
    cancel: CancellationToken,
}

/// Why a connection ended without an error.
enum Exit {
    Cancelled,
    ConsumerGone,
}

impl UpstreamLink {
    /// Create a new link.
    #[must_use]
    pub fn new(
        config: LinkConfig,
        desired: watch::Receiver<BTreeSet<String>>,
        event_tx: mpsc::Sender<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(LinkState::new(config.role));
        Self {
            config,
            codec: FrameCodec::new(),
            desired,
            event_tx,
            state,
            cancel,
        }
    }

    /// Shared state for health reporting.
    #[must_use]
    pub fn state(&self) -> Arc<LinkState> {
        Arc::clone(&self.state)
    }

    /// Run the connection loop until cancelled, the event consumer goes
    /// away, or reconnect attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::MaxReconnectAttemptsExceeded`] when the backoff
    /// budget is spent.
    pub async fn run(mut self) -> Result<(), LinkError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let link = self.config.role.as_str();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(link, "Upstream link cancelled");
                return Ok(());
            }

            self.state.set_status(LinkStatus::Connecting);

            match self.connect_and_run(&mut backoff).await {
                Ok(Exit::Cancelled) => {
                    tracing::info!(link, "Upstream link closed on shutdown");
                    self.state.set_status(LinkStatus::Disconnected);
                    return Ok(());
                }
                Ok(Exit::ConsumerGone) => {
                    tracing::info!(link, "Link event consumer dropped, stopping link");
                    self.state.set_status(LinkStatus::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(link, error = %e, "Upstream connection error");
                    self.state.record_failure(e.to_string());
                    self.state.set_subscription_count(0);
                    metrics::set_upstream_subscriptions(link, 0);

                    if self.event_tx.send(LinkEvent::Disconnected).await.is_err() {
                        return Ok(());
                    }

                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!(link, "Giving up on upstream link");
                        return Err(LinkError::MaxReconnectAttemptsExceeded);
                    };

                    let attempt = backoff.attempt();
                    self.state.increment_reconnect_attempts();
                    metrics::record_reconnect(link);
                    tracing::info!(
                        link,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting upstream link"
                    );

                    if self
                        .event_tx
                        .send(LinkEvent::Reconnecting { attempt })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!(link, "Upstream link cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, authenticate and stream until error or cancellation.
    async fn connect_and_run(&mut self, backoff: &mut Backoff) -> Result<Exit, LinkError> {
        let link = self.config.role.as_str();
        tracing::info!(link, url = %self.config.url, "Connecting upstream link");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(Exit::Cancelled),
            connected = tokio_tungstenite::connect_async(self.config.url.as_str()) => connected?,
        };
        let (mut write, mut read) = ws_stream.split();

        let handshake = tokio::time::timeout(AUTH_TIMEOUT, self.authenticate(&mut write, &mut read));
        tokio::select! {
            () = self.cancel.cancelled() => return Ok(Exit::Cancelled),
            outcome = handshake => {
                outcome.map_err(|_| AuthError::Timeout(AUTH_TIMEOUT))??;
            }
        }

        tracing::info!(link, "Upstream link authenticated");
        self.state.set_status(LinkStatus::Authenticated);
        backoff.reset();
        if self.event_tx.send(LinkEvent::Connected).await.is_err() {
            return Ok(Exit::ConsumerGone);
        }

        let mut active = BTreeSet::new();
        let desired = self.desired.borrow_and_update().clone();
        self.reconcile(&mut write, &mut active, &desired).await?;
        self.state.set_status(LinkStatus::Streaming);
        if self
            .event_tx
            .send(LinkEvent::Subscribed {
                count: active.len(),
            })
            .await
            .is_err()
        {
            return Ok(Exit::ConsumerGone);
        }

        self.stream(&mut write, &mut read, &mut active).await
    }

    /// Drive the handshake until `auth_success`.
    async fn authenticate(&self, write: &mut WsWrite, read: &mut WsRead) -> Result<(), LinkError> {
        let mut handshake = Handshake::new();

        while let Some(message) = read.next().await {
            match message? {
                Message::Text(text) => {
                    let Some(statuses) = self.codec.control(&text) else {
                        tracing::trace!(link = self.config.role.as_str(), "Data before auth ignored");
                        continue;
                    };
                    for status in &statuses {
                        match handshake.on_status(status)? {
                            HandshakeStep::SendAuth => {
                                let auth = ClientCommand::auth(self.config.token.expose());
                                write.send(Message::Text(self.codec.encode(&auth)?.into())).await?;
                            }
                            HandshakeStep::Authenticated => return Ok(()),
                            HandshakeStep::Continue => {}
                        }
                    }
                }
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => return Err(LinkError::ConnectionClosed),
                _ => {}
            }
        }

        Err(LinkError::ConnectionClosed)
    }

    /// Main read loop after the link is streaming.
    async fn stream(
        &mut self,
        write: &mut WsWrite,
        read: &mut WsRead,
        active: &mut BTreeSet<String>,
    ) -> Result<Exit, LinkError> {
        let link = self.config.role.as_str();
        let mut heartbeat = Heartbeat::new(self.config.heartbeat);
        let mut watching = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Exit::Cancelled);
                }
                beat = heartbeat.tick() => match beat {
                    Beat::Ping => write.send(Message::Ping(Vec::new().into())).await?,
                    Beat::Expired => {
                        tracing::warn!(link, "Heartbeat timeout");
                        return Err(LinkError::HeartbeatTimeout);
                    }
                },
                changed = self.desired.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let desired = self.desired.borrow_and_update().clone();
                    self.reconcile(write, active, &desired).await?;
                    if self
                        .event_tx
                        .send(LinkEvent::Subscribed { count: active.len() })
                        .await
                        .is_err()
                    {
                        return Ok(Exit::ConsumerGone);
                    }
                }
                message = read.next() => {
                    let Some(message) = message else {
                        tracing::info!(link, "Upstream stream ended");
                        return Err(LinkError::ConnectionClosed);
                    };
                    heartbeat.record_activity();
                    match message? {
                        Message::Text(text) => {
                            if let Some(statuses) = self.codec.control(&text) {
                                for status in statuses {
                                    tracing::debug!(
                                        link,
                                        status = %status.status,
                                        message = status.message.as_deref().unwrap_or(""),
                                        "Upstream status"
                                    );
                                    if status.status == "error" {
                                        let detail = status.message.unwrap_or(status.status);
                                        if self.event_tx.send(LinkEvent::Error(detail)).await.is_err() {
                                            return Ok(Exit::ConsumerGone);
                                        }
                                    }
                                }
                                continue;
                            }

                            self.state.increment_frames();
                            metrics::record_frame_received(link);
                            if self.event_tx.send(LinkEvent::Frame(text)).await.is_err() {
                                return Ok(Exit::ConsumerGone);
                            }
                        }
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(_) => {
                            tracing::info!(link, "Upstream sent close frame");
                            return Err(LinkError::ConnectionClosed);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Bring the upstream subscription in line with `desired`.
    async fn reconcile(
        &self,
        write: &mut WsWrite,
        active: &mut BTreeSet<String>,
        desired: &BTreeSet<String>,
    ) -> Result<(), LinkError> {
        let link = self.config.role.as_str();
        let (removed, added) = subscription_delta(active, desired);

        // Subscribe first: a pair moving from an exact spec to a covering
        // wildcard must never be absent upstream in between.
        if !added.is_empty() {
            let params = join_set(&added);
            tracing::debug!(link, params = %params, "Subscribing upstream");
            let command = ClientCommand::subscribe(params);
            write.send(Message::Text(self.codec.encode(&command)?.into())).await?;
        }
        if !removed.is_empty() {
            let params = join_set(&removed);
            tracing::debug!(link, params = %params, "Unsubscribing upstream");
            let command = ClientCommand::unsubscribe(params);
            write.send(Message::Text(self.codec.encode(&command)?.into())).await?;
        }

        active.clone_from(desired);
        self.state.set_subscription_count(active.len());
        metrics::set_upstream_subscriptions(link, active.len());
        Ok(())
    }
}

/// Specs to drop and to add to move from `active` to `desired`.
#[must_use]
pub fn subscription_delta(
    active: &BTreeSet<String>,
    desired: &BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let removed = active.difference(desired).cloned().collect();
    let added = desired.difference(active).cloned().collect();
    (removed, added)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn delta_from_empty_adds_everything() {
        let (removed, added) = subscription_delta(&BTreeSet::new(), &set(&["T.AAPL", "Q.MSFT"]));
        assert!(removed.is_empty());
        assert_eq!(added, set(&["Q.MSFT", "T.AAPL"]));
    }

    #[test]
    fn delta_only_touches_changes() {
        let (removed, added) =
            subscription_delta(&set(&["T.AAPL", "Q.MSFT"]), &set(&["T.AAPL", "T.*"]));
        assert_eq!(removed, set(&["Q.MSFT"]));
        assert_eq!(added, set(&["T.*"]));
    }

    #[test]
    fn config_from_settings() {
        let settings = LinkSettings::default();
        let config = LinkConfig::new(LinkRole::Bars, "ws://127.0.0.1:1", Secret::new("t"), &settings);
        assert_eq!(config.backoff.initial_delay, settings.reconnect_delay_initial);
        assert_eq!(config.heartbeat.ping_interval, settings.heartbeat_interval);
    }
}
