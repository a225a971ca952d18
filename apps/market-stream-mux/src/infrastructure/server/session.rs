//! Client Session
//!
//! One accepted WebSocket connection. The reader half runs the command state
//! machine (unauthenticated, authenticated, closed); a separate writer task
//! drains the session's [`OutboundQueue`] so a slow socket never stalls the
//! reader or any producer.
//!
//! Replies go through the same queue as data. The `subscribe`
//! acknowledgement is queued before the handler registers the specs, so it
//! precedes the first frame routed for them.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::TokenAuthenticator;
use super::queue::OutboundQueue;
use crate::application::ports::SessionHandler;
use crate::domain::subscription::{SessionId, parse_spec_list};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{ClientCommand, CommandKind, Frame, FrameCodec, StatusReply};

type ClientWrite = SplitSink<WebSocketStream<TcpStream>, Message>;
type ClientRead = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a session needs from its server.
pub struct SessionContext {
    /// Tier label for logs and metrics.
    pub tier: &'static str,
    /// Tier behavior.
    pub handler: Arc<dyn SessionHandler>,
    /// Token check for `auth`.
    pub authenticator: TokenAuthenticator,
    /// Outbound queue capacity in frames.
    pub queue_capacity: usize,
}

/// Fresh random session id.
#[must_use]
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().as_u64_pair().0
}

/// Per-connection command state.
struct Session {
    id: SessionId,
    ctx: Arc<SessionContext>,
    codec: FrameCodec,
    queue: OutboundQueue,
    authenticated: bool,
}

/// Serve one accepted connection until it closes or `shutdown` fires.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: &CancellationToken,
) {
    let tier = ctx.tier;
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(tier, peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let id = new_session_id();
    let closer = shutdown.child_token();
    let (queue, rx) = OutboundQueue::new(id, tier, ctx.queue_capacity, closer.clone());
    let (write, mut read) = ws.split();
    let writer = tokio::spawn(write_loop(write, rx, closer.clone()));

    tracing::info!(tier, session_id = id, peer = %peer, "Client connected");

    let mut session = Session {
        id,
        ctx,
        codec: FrameCodec::new(),
        queue,
        authenticated: false,
    };
    session.reply(&StatusReply::connected());
    session.read_loop(&mut read, &closer).await;

    closer.cancel();
    if session.authenticated {
        session.ctx.handler.on_closed(id).await;
    }
    let _ = writer.await;

    tracing::info!(tier, session_id = id, peer = %peer, "Client disconnected");
}

impl Session {
    async fn read_loop(&mut self, read: &mut ClientRead, closer: &CancellationToken) {
        loop {
            let message = tokio::select! {
                () = closer.cancelled() => return,
                message = read.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(tier = self.ctx.tier, session_id = self.id, error = %e, "Client read error");
                    return;
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let tier = self.ctx.tier;
        let command: ClientCommand = match serde_json::from_str(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(tier, session_id = self.id, error = %e, "Malformed client frame dropped");
                metrics::record_malformed(tier, "client_json");
                return;
            }
        };

        match command.kind() {
            CommandKind::Auth(token) => self.on_auth(token).await,
            CommandKind::Subscribe(params) => {
                if !self.authenticated {
                    tracing::debug!(tier, session_id = self.id, "Subscribe before auth ignored");
                    return;
                }
                let parsed = parse_spec_list(params);
                for (raw, reason) in &parsed.rejected {
                    tracing::debug!(tier, session_id = self.id, spec = %raw, reason = %reason, "Spec skipped");
                }
                let accepted = parsed.accepted_params();
                self.reply(&StatusReply::subscribed(&accepted));
                self.ctx.handler.on_subscribe(self.id, &parsed.accepted).await;
                tracing::info!(tier, session_id = self.id, specs = %accepted, "Client subscribed");
            }
            CommandKind::Unsubscribe(params) => {
                if !self.authenticated {
                    tracing::debug!(tier, session_id = self.id, "Unsubscribe before auth ignored");
                    return;
                }
                let parsed = parse_spec_list(params);
                let accepted = parsed.accepted_params();
                self.reply(&StatusReply::unsubscribed(&accepted));
                self.ctx.handler.on_unsubscribe(self.id, &parsed.accepted).await;
                tracing::info!(tier, session_id = self.id, specs = %accepted, "Client unsubscribed");
            }
            CommandKind::Unknown(action) => {
                tracing::debug!(tier, session_id = self.id, action, "Unknown action ignored");
                metrics::record_malformed(tier, "unknown_action");
            }
        }
    }

    async fn on_auth(&mut self, token: &str) {
        let tier = self.ctx.tier;
        if !self.ctx.authenticator.verify(token) {
            tracing::warn!(tier, session_id = self.id, "Client authentication failed");
            self.reply(&StatusReply::auth_failed());
            return;
        }

        if !self.authenticated {
            self.authenticated = true;
            self.ctx.handler.on_authenticated(self.id, self.queue.clone()).await;
            tracing::info!(tier, session_id = self.id, "Client authenticated");
        }
        self.reply(&StatusReply::auth_success());
    }

    fn reply(&self, reply: &StatusReply) {
        match self.codec.encode(reply) {
            Ok(text) => {
                self.queue.push(Frame::from(text));
            }
            Err(e) => {
                tracing::error!(tier = self.ctx.tier, session_id = self.id, error = %e, "Failed to encode reply");
            }
        }
    }
}

/// Drain the outbound queue into the socket.
async fn write_loop(
    mut write: ClientWrite,
    mut rx: mpsc::Receiver<Frame>,
    closer: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = closer.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if write.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }

    closer.cancel();
    let _ = write.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::{Duration, timeout};

    use super::*;
    use crate::domain::subscription::SubscriptionSpec;
    use crate::infrastructure::config::Secret;

    const DATA: &str = r#"[{"ev":"T","sym":"AAPL","p":1.0,"s":1,"t":1}]"#;

    /// Queues a data frame the moment specs are registered, like a router
    /// matching a frame concurrently.
    #[derive(Default)]
    struct EagerRouter {
        queue: Mutex<Option<OutboundQueue>>,
    }

    #[async_trait]
    impl SessionHandler for EagerRouter {
        async fn on_authenticated(&self, _session: SessionId, queue: OutboundQueue) {
            *self.queue.lock() = Some(queue);
        }

        async fn on_subscribe(&self, _session: SessionId, _specs: &[SubscriptionSpec]) {
            if let Some(queue) = self.queue.lock().as_ref() {
                queue.push(Frame::from_static(DATA));
            }
        }

        async fn on_unsubscribe(&self, _session: SessionId, _specs: &[SubscriptionSpec]) {}

        async fn on_closed(&self, _session: SessionId) {}
    }

    async fn next_text<S>(client: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = timeout(Duration::from_secs(2), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = message {
                return text.to_string();
            }
        }
    }

    #[test]
    fn session_ids_are_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn subscribe_ack_precedes_routed_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(SessionContext {
            tier: "test",
            handler: Arc::new(EagerRouter::default()),
            authenticator: TokenAuthenticator::new(Secret::new("token")),
            queue_capacity: 16,
        });
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_session(stream, peer, ctx, &server_shutdown).await;
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        assert!(next_text(&mut client).await.contains("connected"));

        client
            .send(Message::text(r#"{"action":"auth","params":"token"}"#))
            .await
            .unwrap();
        assert!(next_text(&mut client).await.contains("auth_success"));

        client
            .send(Message::text(r#"{"action":"subscribe","params":"T.AAPL"}"#))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut client).await,
            r#"{"status":"success","message":"subscribed to T.AAPL"}"#
        );
        assert_eq!(next_text(&mut client).await, DATA);

        shutdown.cancel();
    }
}
