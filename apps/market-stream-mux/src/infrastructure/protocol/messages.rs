//! Client Protocol Messages
//!
//! Commands clients send and the status replies servers answer with. The
//! same shapes are spoken between tiers, so an upstream link builds its
//! requests from these types too.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"action":"auth","params":"<token>"}
//! {"action":"subscribe","params":"T.AAPL,250Ms.AAPL"}
//! {"status":"success","message":"subscribed to T.AAPL,250Ms.AAPL"}
//! ```

use serde::{Deserialize, Serialize};

/// Raw command as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    /// Action name: `auth`, `subscribe` or `unsubscribe`
    pub action: String,

    /// Token or comma-separated spec list
    #[serde(default, deserialize_with = "lenient_params")]
    pub params: String,
}

/// Non-string `params` (numbers, null, objects) are read as empty.
fn lenient_params<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        _ => String::new(),
    })
}

impl ClientCommand {
    /// Authentication command.
    #[must_use]
    pub fn auth(token: impl Into<String>) -> Self {
        Self::new("auth", token)
    }

    /// Subscribe command.
    #[must_use]
    pub fn subscribe(params: impl Into<String>) -> Self {
        Self::new("subscribe", params)
    }

    /// Unsubscribe command.
    #[must_use]
    pub fn unsubscribe(params: impl Into<String>) -> Self {
        Self::new("unsubscribe", params)
    }

    fn new(action: &str, params: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            params: params.into(),
        }
    }

    /// Classify the command.
    #[must_use]
    pub fn kind(&self) -> CommandKind<'_> {
        match self.action.as_str() {
            "auth" => CommandKind::Auth(&self.params),
            "subscribe" => CommandKind::Subscribe(&self.params),
            "unsubscribe" => CommandKind::Unsubscribe(&self.params),
            other => CommandKind::Unknown(other),
        }
    }
}

/// Command classified by action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind<'a> {
    /// `auth` with the presented token.
    Auth(&'a str),
    /// `subscribe` with the raw spec list.
    Subscribe(&'a str),
    /// `unsubscribe` with the raw spec list.
    Unsubscribe(&'a str),
    /// Any other action.
    Unknown(&'a str),
}

/// Status values used in replies.
pub mod status {
    /// Greeting sent on accept.
    pub const CONNECTED: &str = "connected";
    /// Authentication accepted.
    pub const AUTH_SUCCESS: &str = "auth_success";
    /// Authentication rejected.
    pub const AUTH_FAILED: &str = "auth_failed";
    /// Subscription change applied.
    pub const SUCCESS: &str = "success";
}

/// Status reply sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// Status code
    pub status: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReply {
    fn new(status: &str, message: Option<String>) -> Self {
        Self {
            status: status.to_string(),
            message,
        }
    }

    /// Greeting sent right after accept.
    #[must_use]
    pub fn connected() -> Self {
        Self::new(status::CONNECTED, Some(status::CONNECTED.to_string()))
    }

    /// Reply to a valid `auth`.
    #[must_use]
    pub fn auth_success() -> Self {
        Self::new(status::AUTH_SUCCESS, None)
    }

    /// Reply to an invalid `auth`.
    #[must_use]
    pub fn auth_failed() -> Self {
        Self::new(status::AUTH_FAILED, None)
    }

    /// Reply to `subscribe` listing the accepted specs.
    #[must_use]
    pub fn subscribed(accepted: &str) -> Self {
        Self::new(status::SUCCESS, Some(format!("subscribed to {accepted}")))
    }

    /// Reply to `unsubscribe` listing the accepted specs.
    #[must_use]
    pub fn unsubscribed(accepted: &str) -> Self {
        Self::new(status::SUCCESS, Some(format!("unsubscribed from {accepted}")))
    }
}
