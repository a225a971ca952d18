//! Market Data Streaming Types
//!
//! Core domain types for market data: event classes, trades, quotes,
//! native bars, and synthesized millisecond bars. Field names follow the
//! vendor wire format so envelopes can be decoded without an adapter layer.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Marker value carried in the `T` field of every synthesized bar.
pub const SYNTHESIZED_BAR_MARKER: &str = "b";

// =============================================================================
// Event Class
// =============================================================================

/// Event class of an envelope or a subscription.
///
/// Doubles as the routing tag: an envelope is routed by
/// `(EventClass, symbol)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventClass {
    /// Trade tick (`T`).
    Trade,
    /// Quote update (`Q`).
    Quote,
    /// Native per-second aggregate (`A`).
    SecondBar,
    /// Native per-minute aggregate (`AM`).
    MinuteBar,
    /// Synthesized bar of the given width in milliseconds (`<N>Ms`).
    MillisecondBar(u64),
    /// Limit-up/limit-down band (`LULD`).
    Luld,
    /// Fair market value (`FMV`).
    Fmv,
    /// Every non-millisecond class (`*`).
    Wildcard,
}

impl EventClass {
    /// Non-bar classes covered by a wildcard subscription.
    pub const NON_BAR_WILDCARD: [Self; 4] = [Self::Trade, Self::Quote, Self::Luld, Self::Fmv];

    /// Bar classes covered by a wildcard subscription.
    ///
    /// Millisecond bars are deliberately absent.
    pub const BAR_WILDCARD: [Self; 2] = [Self::SecondBar, Self::MinuteBar];

    /// Map a vendor `ev` code to its event class.
    #[must_use]
    pub fn from_vendor_code(code: &str) -> Option<Self> {
        match code {
            "T" => Some(Self::Trade),
            "Q" => Some(Self::Quote),
            "A" => Some(Self::SecondBar),
            "AM" => Some(Self::MinuteBar),
            "LULD" => Some(Self::Luld),
            "FMV" => Some(Self::Fmv),
            _ => None,
        }
    }

    /// Whether this class travels over the bar upstream.
    #[must_use]
    pub const fn is_bar(self) -> bool {
        matches!(
            self,
            Self::SecondBar | Self::MinuteBar | Self::MillisecondBar(_)
        )
    }

    /// Whether this is a synthesized millisecond bar class.
    #[must_use]
    pub const fn is_millisecond(self) -> bool {
        matches!(self, Self::MillisecondBar(_))
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trade => f.write_str("T"),
            Self::Quote => f.write_str("Q"),
            Self::SecondBar => f.write_str("A"),
            Self::MinuteBar => f.write_str("AM"),
            Self::MillisecondBar(interval) => write!(f, "{interval}Ms"),
            Self::Luld => f.write_str("LULD"),
            Self::Fmv => f.write_str("FMV"),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

/// Routing key extracted from an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingKey<'a> {
    /// Event class of the envelope.
    pub class: EventClass,
    /// Symbol the envelope refers to.
    pub symbol: &'a str,
}

// =============================================================================
// Envelopes
// =============================================================================

/// Trade tick.
///
/// # Wire Format (JSON)
/// ```json
/// {"ev":"T","sym":"AAPL","x":4,"i":"52983525029461","p":187.2,"s":100,"t":1700000000123}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Event code (always "T")
    #[serde(rename = "ev")]
    pub event: String,

    /// Ticker symbol
    #[serde(rename = "sym")]
    pub symbol: String,

    /// Trade price
    #[serde(rename = "p", with = "rust_decimal::serde::float")]
    pub price: Decimal,

    /// Trade size (shares)
    #[serde(rename = "s")]
    pub size: u64,

    /// Exchange timestamp (Unix epoch milliseconds)
    #[serde(rename = "t")]
    pub timestamp: i64,
}

impl Trade {
    /// Create a trade envelope.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: Decimal, size: u64, timestamp: i64) -> Self {
        Self {
            event: "T".to_string(),
            symbol: symbol.into(),
            price,
            size,
            timestamp,
        }
    }
}

/// Quote update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Event code (always "Q")
    #[serde(rename = "ev")]
    pub event: String,

    /// Ticker symbol
    #[serde(rename = "sym")]
    pub symbol: String,

    /// Bid price
    #[serde(rename = "bp", with = "rust_decimal::serde::float")]
    pub bid_price: Decimal,

    /// Bid size
    #[serde(rename = "bs")]
    pub bid_size: u64,

    /// Ask price
    #[serde(rename = "ap", with = "rust_decimal::serde::float")]
    pub ask_price: Decimal,

    /// Ask size
    #[serde(rename = "as")]
    pub ask_size: u64,

    /// Quote timestamp (Unix epoch milliseconds)
    #[serde(rename = "t")]
    pub timestamp: i64,
}

/// Native vendor aggregate, per second (`A`) or per minute (`AM`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeBar {
    /// Event code: "A" or "AM"
    #[serde(rename = "ev")]
    pub event: String,

    /// Ticker symbol
    #[serde(rename = "sym")]
    pub symbol: String,

    /// Open price
    #[serde(rename = "o", with = "rust_decimal::serde::float")]
    pub open: Decimal,

    /// High price
    #[serde(rename = "h", with = "rust_decimal::serde::float")]
    pub high: Decimal,

    /// Low price
    #[serde(rename = "l", with = "rust_decimal::serde::float")]
    pub low: Decimal,

    /// Close price
    #[serde(rename = "c", with = "rust_decimal::serde::float")]
    pub close: Decimal,

    /// Volume (shares)
    #[serde(rename = "v")]
    pub volume: u64,

    /// Window start (Unix epoch milliseconds)
    #[serde(rename = "s")]
    pub start: i64,

    /// Window end (Unix epoch milliseconds)
    #[serde(rename = "e")]
    pub end: i64,
}

/// Bar synthesized from trades over a fixed millisecond window.
///
/// # Wire Format (JSON)
/// ```json
/// {"T":"b","interval":500,"S":"AAPL","o":10.0,"h":11.0,"l":9.5,"c":10.5,"v":300,"n":3,"s":1000,"e":1500}
/// ```
///
/// `e` is the exclusive end of the window, matching native aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizedBar {
    /// Marker (always "b")
    #[serde(rename = "T")]
    pub marker: String,

    /// Window width in milliseconds
    pub interval: u64,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// Open price
    #[serde(rename = "o", with = "rust_decimal::serde::float")]
    pub open: Decimal,

    /// High price
    #[serde(rename = "h", with = "rust_decimal::serde::float")]
    pub high: Decimal,

    /// Low price
    #[serde(rename = "l", with = "rust_decimal::serde::float")]
    pub low: Decimal,

    /// Close price
    #[serde(rename = "c", with = "rust_decimal::serde::float")]
    pub close: Decimal,

    /// Volume (shares)
    #[serde(rename = "v")]
    pub volume: u64,

    /// Number of trades folded into the bar
    #[serde(rename = "n")]
    pub trade_count: u64,

    /// Window start (Unix epoch milliseconds)
    #[serde(rename = "s")]
    pub start: i64,

    /// Window end, exclusive (Unix epoch milliseconds)
    #[serde(rename = "e")]
    pub end: i64,
}
