//! Upstream Authentication Handshake
//!
//! Drives the token handshake every upstream speaks, vendor and internal
//! tiers alike.
//!
//! # Authentication Flow
//!
//! 1. Connect to the WebSocket endpoint
//! 2. Receive `connected` status
//! 3. Send `{"action":"auth","params":"<token>"}`
//! 4. Receive `auth_success` or `auth_failed`
//!
//! Statuses arrive either as a bare object or wrapped in an array
//! (`[{"ev":"status","status":"connected",...}]`); the codec normalizes both.

use std::time::Duration;

use thiserror::Error;

use crate::infrastructure::protocol::ControlStatus;
use crate::infrastructure::protocol::messages::status;

/// Time allowed from connect to `auth_success`.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Upstream rejected the token.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// Handshake did not finish within [`AUTH_TIMEOUT`].
    #[error("authentication timeout after {0:?}")]
    Timeout(Duration),
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Socket open, waiting for the greeting.
    #[default]
    AwaitingGreeting,
    /// Token sent, waiting for the verdict.
    AwaitingVerdict,
    /// Upstream accepted the token.
    Authenticated,
}

/// What the link should do after a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send the auth command now.
    SendAuth,
    /// Handshake finished.
    Authenticated,
    /// Nothing to do.
    Continue,
}

/// Authentication state machine for one connection.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::infrastructure::protocol::ControlStatus;
/// use market_stream_mux::infrastructure::upstream::auth::{Handshake, HandshakeStep};
///
/// let mut handshake = Handshake::new();
/// let status = |s: &str| ControlStatus { status: s.to_string(), message: None };
///
/// assert_eq!(handshake.on_status(&status("connected")), Ok(HandshakeStep::SendAuth));
/// assert_eq!(handshake.on_status(&status("auth_success")), Ok(HandshakeStep::Authenticated));
/// assert!(handshake.is_authenticated());
/// ```
#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
}

impl Handshake {
    /// Create a handshake awaiting the greeting.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingGreeting,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Check if currently authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, HandshakeState::Authenticated)
    }

    /// Advance on a control status.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] when the upstream refuses the token.
    pub fn on_status(&mut self, control: &ControlStatus) -> Result<HandshakeStep, AuthError> {
        match (self.state, control.status.as_str()) {
            (HandshakeState::AwaitingGreeting, status::CONNECTED) => {
                self.state = HandshakeState::AwaitingVerdict;
                Ok(HandshakeStep::SendAuth)
            }
            (HandshakeState::AwaitingVerdict, status::AUTH_SUCCESS) => {
                self.state = HandshakeState::Authenticated;
                Ok(HandshakeStep::Authenticated)
            }
            (HandshakeState::Authenticated, _) => Ok(HandshakeStep::Continue),
            (_, status::AUTH_FAILED) => Err(AuthError::Rejected(
                control
                    .message
                    .clone()
                    .unwrap_or_else(|| status::AUTH_FAILED.to_string()),
            )),
            _ => Ok(HandshakeStep::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(s: &str) -> ControlStatus {
        ControlStatus {
            status: s.to_string(),
            message: None,
        }
    }

    #[test]
    fn full_handshake() {
        let mut handshake = Handshake::new();
        assert_eq!(handshake.state(), HandshakeState::AwaitingGreeting);

        assert_eq!(handshake.on_status(&status("connected")), Ok(HandshakeStep::SendAuth));
        assert_eq!(handshake.state(), HandshakeState::AwaitingVerdict);

        assert_eq!(
            handshake.on_status(&status("auth_success")),
            Ok(HandshakeStep::Authenticated)
        );
        assert!(handshake.is_authenticated());
    }

    #[test]
    fn auth_success_before_greeting_is_ignored() {
        let mut handshake = Handshake::new();
        assert_eq!(
            handshake.on_status(&status("auth_success")),
            Ok(HandshakeStep::Continue)
        );
        assert!(!handshake.is_authenticated());
    }

    #[test]
    fn rejection_carries_message() {
        let mut handshake = Handshake::new();
        handshake.on_status(&status("connected")).unwrap();

        let err = handshake
            .on_status(&ControlStatus {
                status: "auth_failed".to_string(),
                message: Some("authentication failed".to_string()),
            })
            .unwrap_err();

        assert_eq!(err, AuthError::Rejected("authentication failed".to_string()));
    }

    #[test]
    fn subscription_acks_after_auth_are_ignored() {
        let mut handshake = Handshake::new();
        handshake.on_status(&status("connected")).unwrap();
        handshake.on_status(&status("auth_success")).unwrap();

        assert_eq!(handshake.on_status(&status("success")), Ok(HandshakeStep::Continue));
        assert_eq!(handshake.on_status(&status("auth_failed")), Ok(HandshakeStep::Continue));
    }
}
