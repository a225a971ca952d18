//! Configuration Module
//!
//! Per-tier configuration loaded from the environment.

mod settings;

pub use settings::{
    BarSynthConfig, ConfigError, DEFAULT_BAR_SYNTH_URL, DEFAULT_INGRESS_URL,
    DEFAULT_VENDOR_STREAM_URL, IngressConfig, LinkSettings, RouterConfig, Secret, ServerSettings,
    expand_event_classes,
};
