//! Tier Configuration Settings
//!
//! Configuration types for the three tiers, loaded from environment
//! variables. Every `from_env` delegates to `from_lookup` so tests can
//! inject values without touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use crate::infrastructure::broadcast::DEFAULT_BROADCAST_CAPACITY;

/// Default vendor stream endpoint.
pub const DEFAULT_VENDOR_STREAM_URL: &str = "wss://socket.polygon.io/stocks";

/// Default ingress endpoint for internal clients.
pub const DEFAULT_INGRESS_URL: &str = "ws://127.0.0.1:8765";

/// Default bar-synthesis endpoint for the router.
pub const DEFAULT_BAR_SYNTH_URL: &str = "ws://127.0.0.1:8766";

/// Secret value whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret for sending over the wire.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// Upstream link settings shared by every tier.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    /// Interval between keepalive pings.
    pub heartbeat_interval: Duration,
    /// Silence tolerated after a ping before the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_delay_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_delay_max: Duration,
    /// Backoff multiplier.
    pub reconnect_delay_multiplier: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

/// Listener settings for one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket listen port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
    /// Frames buffered per client before it is closed as slow.
    pub client_queue_capacity: usize,
}

const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 1024;

/// Ingress tier configuration.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Vendor WebSocket URL.
    pub vendor_url: String,
    /// Vendor API key.
    pub vendor_key: Secret,
    /// Static vendor subscription, e.g. `T.*,Q.*,A.*,AM.*`.
    pub vendor_params: String,
    /// Token internal clients must present.
    pub auth_token: Secret,
    /// Listener settings.
    pub server: ServerSettings,
    /// Vendor link settings.
    pub link: LinkSettings,
    /// Firehose broadcast capacity.
    pub broadcast_capacity: usize,
}

impl IngressConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        Ok(Self {
            vendor_url: vars.string("VENDOR_STREAM_URL", DEFAULT_VENDOR_STREAM_URL),
            vendor_key: Secret::new(vars.required("VENDOR_API_KEY")?),
            vendor_params: expand_event_classes(&vars.string("INGRESS_EVENT_CLASSES", "T,Q,A,AM")),
            auth_token: Secret::new(vars.required("STREAM_AUTH_TOKEN")?),
            server: vars.server("INGRESS_PORT", 8765, "INGRESS_HEALTH_PORT", 8082)?,
            link: vars.link()?,
            broadcast_capacity: vars.parse("BROADCAST_CAPACITY", DEFAULT_BROADCAST_CAPACITY)?,
        })
    }
}

/// Bar-synthesis tier configuration.
#[derive(Debug, Clone)]
pub struct BarSynthConfig {
    /// Ingress tier URL.
    pub ingress_url: String,
    /// Subscription sent to the ingress tier.
    pub upstream_params: String,
    /// Token shared by internal tiers.
    pub auth_token: Secret,
    /// Listener settings.
    pub server: ServerSettings,
    /// Ingress link settings.
    pub link: LinkSettings,
    /// Outbound broadcast capacity.
    pub broadcast_capacity: usize,
}

impl BarSynthConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        Ok(Self {
            ingress_url: vars.string("INGRESS_URL", DEFAULT_INGRESS_URL),
            upstream_params: vars.string("BAR_SYNTH_UPSTREAM_PARAMS", "T.*,A.*,AM.*"),
            auth_token: Secret::new(vars.required("STREAM_AUTH_TOKEN")?),
            server: vars.server("BAR_SYNTH_PORT", 8766, "BAR_SYNTH_HEALTH_PORT", 8083)?,
            link: vars.link()?,
            broadcast_capacity: vars.parse("BROADCAST_CAPACITY", DEFAULT_BROADCAST_CAPACITY)?,
        })
    }
}

/// Subscription router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ingress tier URL (ticks link).
    pub ingress_url: String,
    /// Bar-synthesis tier URL (bars link).
    pub bar_synth_url: String,
    /// Token clients and internal tiers share.
    pub auth_token: Secret,
    /// Listener settings.
    pub server: ServerSettings,
    /// Settings for both links.
    pub link: LinkSettings,
}

impl RouterConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does
    /// not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        Ok(Self {
            ingress_url: vars.string("INGRESS_URL", DEFAULT_INGRESS_URL),
            bar_synth_url: vars.string("BAR_SYNTH_URL", DEFAULT_BAR_SYNTH_URL),
            auth_token: Secret::new(vars.required("STREAM_AUTH_TOKEN")?),
            server: vars.server("ROUTER_PORT", 8767, "ROUTER_HEALTH_PORT", 8084)?,
            link: vars.link()?,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },
}

/// Turn `T,Q,A,AM` into `T.*,Q.*,A.*,AM.*`. Entries that already name a
/// symbol pass through.
#[must_use]
pub fn expand_event_classes(classes: &str) -> String {
    classes
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| {
            if c.contains('.') {
                c.to_string()
            } else {
                format!("{c}.*")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }

    fn server(
        &self,
        port_key: &str,
        port: u16,
        health_key: &str,
        health_port: u16,
    ) -> Result<ServerSettings, ConfigError> {
        Ok(ServerSettings {
            port: self.parse(port_key, port)?,
            health_port: self.parse(health_key, health_port)?,
            client_queue_capacity: self
                .parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY)?
                .max(1),
        })
    }

    fn link(&self) -> Result<LinkSettings, ConfigError> {
        let defaults = LinkSettings::default();
        Ok(LinkSettings {
            heartbeat_interval: self
                .secs("LINK_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            heartbeat_timeout: self.secs("LINK_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            reconnect_delay_initial: self.millis(
                "LINK_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: self
                .secs("LINK_RECONNECT_DELAY_MAX_SECS", defaults.reconnect_delay_max)?,
            reconnect_delay_multiplier: self.parse(
                "LINK_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            )?,
            max_reconnect_attempts: self
                .parse("LINK_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?,
        })
    }
}
