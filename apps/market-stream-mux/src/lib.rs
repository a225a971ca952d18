#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Stream Mux - Single-Upstream Market Data Fan-Out
//!
//! Three cooperating services that share one vendor market data connection
//! among many downstream consumers:
//!
//! - **Ingress** (`stream-ingress`): holds the only vendor connection and
//!   rebroadcasts every frame verbatim to internal clients.
//! - **Bar synthesis** (`bar-synth`): consumes the ingress firehose and adds
//!   millisecond OHLCV bars (`<N>Ms.<SYMBOL>`) next to the native bars.
//! - **Router** (`stream-router`): the client-facing proxy. Tracks each
//!   client's subscriptions, keeps the minimal upstream subscription on both
//!   internal tiers, and forwards only what each client asked for.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: event classes, subscription grammar and registry, bar
//!   aggregation
//! - **Application**: session/upstream ports and the three tier services
//! - **Infrastructure**: WebSocket server and upstream links, codec,
//!   broadcast hub, config, health, metrics, telemetry
//!
//! # Data Flow
//!
//! ```text
//! Vendor WS ──► Ingress ──┬──────────────────────► Router ──► Client 1
//!               (firehose)│                        ▲  │ ───► Client 2
//!                         └──► Bar Synth ──────────┘  └────► Client N
//!                              (native + Ms bars)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Streaming types, subscriptions, aggregation.
pub mod domain;

/// Application layer - Tier services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::aggregation::{AggregationBucket, BarAggregator, BarInterest, bucket_key};
pub use domain::streaming::{EventClass, NativeBar, Quote, RoutingKey, SynthesizedBar, Trade};
pub use domain::subscription::{
    SessionId, SubscriptionChanges, SubscriptionRegistry, SubscriptionSpec, parse_spec_list,
};

// Services
pub use application::ports::{SessionHandler, UpstreamPort, UpstreamTarget};
pub use application::services::{BarEngine, BarSynthService, FirehoseService, RouterService};

// Infrastructure config
pub use infrastructure::config::{
    BarSynthConfig, ConfigError, IngressConfig, LinkSettings, RouterConfig, Secret,
    ServerSettings,
};

// Servers and links
pub use infrastructure::broadcast::FrameHub;
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{ServerError, StreamServer, TokenAuthenticator};
pub use infrastructure::upstream::{
    DesiredSubscriptions, LinkConfig, LinkError, LinkEvent, LinkRole, UpstreamLink,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
