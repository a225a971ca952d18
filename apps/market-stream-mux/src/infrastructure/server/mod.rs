//! Client-Facing WebSocket Server
//!
//! Shared by all three tiers: accepts connections, runs one session task per
//! client, and hands authenticated sessions to the tier's
//! [`SessionHandler`](crate::application::ports::SessionHandler).
//!
//! # Example
//!
//! ```rust,ignore
//! let server = StreamServer::bind(addr, "router", handler, authenticator, 1024, cancel).await?;
//! tracing::info!(addr = %server.local_addr(), "Listening");
//! server.run().await;
//! ```

pub mod auth;
pub mod queue;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use auth::TokenAuthenticator;
pub use queue::{Delivery, OutboundQueue};
pub use session::SessionContext;

use crate::application::ports::SessionHandler;
use crate::infrastructure::metrics;

/// Errors from the client-facing server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Could not bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listening server for one tier.
pub struct StreamServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    sessions: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        tier: &'static str,
        handler: Arc<dyn SessionHandler>,
        authenticator: TokenAuthenticator,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                tier,
                handler,
                authenticator,
                queue_capacity,
            }),
            sessions: Arc::new(AtomicUsize::new(0)),
            cancel,
        })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared count of connected sessions, for health reporting.
    #[must_use]
    pub fn session_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.sessions)
    }

    /// Accept clients until cancelled.
    pub async fn run(self) {
        let tier = self.ctx.tier;
        tracing::info!(tier, "Client server accepting connections");

        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(tier, error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let ctx = Arc::clone(&self.ctx);
            let sessions = Arc::clone(&self.sessions);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let active = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_active_sessions(tier, active);

                session::run_session(stream, peer, ctx, &cancel).await;

                let active = sessions.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                metrics::set_active_sessions(tier, active);
            });
        }

        tracing::info!(tier, "Client server stopped");
    }
}
