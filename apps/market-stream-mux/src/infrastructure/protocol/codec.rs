//! Frame Codec
//!
//! Splits data frames into envelopes without re-serializing them, extracts
//! the routing key of each envelope, and recognizes control frames.
//!
//! Envelopes are handled as borrowed [`RawValue`]s so forwarded text is
//! byte-for-byte what arrived.
//!
//! # Envelope Shapes
//!
//! ```json
//! {"ev":"T","sym":"AAPL","p":187.2,"s":100,"t":1700000000123}
//! {"ev":"LULD","T":"AAPL","h":190.1,"l":180.3,"t":1700000000123}
//! {"T":"b","interval":500,"S":"AAPL","o":10.0,"h":11.0,"l":9.5,"c":10.5,"v":300,"n":3,"s":1000,"e":1500}
//! ```
//!
//! # Control Frames
//!
//! ```json
//! {"status":"auth_success"}
//! [{"ev":"status","status":"auth_success","message":"authenticated"}]
//! ```

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::domain::streaming::{EventClass, RoutingKey, SYNTHESIZED_BAR_MARKER};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither a JSON array nor an object.
    #[error("expected JSON array or object")]
    NotJson,

    /// Envelope carries an event code this system does not route.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// Envelope has no symbol.
    #[error("envelope has no symbol")]
    MissingSymbol,

    /// Synthesized bar without a positive interval.
    #[error("synthesized bar has no interval")]
    MissingInterval,
}

impl CodecError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) | Self::NotJson => "json",
            Self::UnknownEvent(_) => "unknown_event",
            Self::MissingSymbol => "missing_symbol",
            Self::MissingInterval => "missing_interval",
        }
    }
}

/// Routing-relevant fields of an envelope.
#[derive(Debug, Deserialize)]
struct EnvelopeHeader<'a> {
    #[serde(borrow, default)]
    ev: Option<&'a str>,
    #[serde(borrow, default)]
    sym: Option<&'a str>,
    #[serde(rename = "T", borrow, default)]
    tag: Option<&'a str>,
    #[serde(rename = "S", borrow, default)]
    bar_symbol: Option<&'a str>,
    #[serde(default)]
    interval: Option<u64>,
}

/// Status carried by a control frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlStatus {
    /// Status code, e.g. `connected`, `auth_success`, `success`
    pub status: String,

    /// Optional detail
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ControlFrame {
    One(ControlStatus),
    Many(Vec<ControlStatus>),
}

/// JSON frame codec shared by every tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Split a data frame into its envelopes.
    ///
    /// Accepts a JSON array of envelopes or a single envelope object.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON of either shape.
    pub fn split<'a>(&self, text: &'a str) -> Result<Vec<&'a RawValue>, CodecError> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('[') {
            Ok(serde_json::from_str(text)?)
        } else if trimmed.starts_with('{') {
            Ok(vec![serde_json::from_str(text)?])
        } else {
            Err(CodecError::NotJson)
        }
    }

    /// Extract the routing key of one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error for envelopes that carry no routable class or symbol.
    pub fn routing_key<'a>(&self, envelope: &'a RawValue) -> Result<RoutingKey<'a>, CodecError> {
        let header: EnvelopeHeader<'a> = serde_json::from_str(envelope.get())?;

        if let Some(ev) = header.ev {
            let class = EventClass::from_vendor_code(ev)
                .ok_or_else(|| CodecError::UnknownEvent(ev.to_string()))?;
            let symbol = if class == EventClass::Luld {
                header.tag.or(header.sym)
            } else {
                header.sym
            };
            return symbol
                .filter(|s| !s.is_empty())
                .map(|symbol| RoutingKey { class, symbol })
                .ok_or(CodecError::MissingSymbol);
        }

        match header.tag {
            Some(SYNTHESIZED_BAR_MARKER) => {
                let interval = header
                    .interval
                    .filter(|i| *i > 0)
                    .ok_or(CodecError::MissingInterval)?;
                let symbol = header
                    .bar_symbol
                    .filter(|s| !s.is_empty())
                    .ok_or(CodecError::MissingSymbol)?;
                Ok(RoutingKey {
                    class: EventClass::MillisecondBar(interval),
                    symbol,
                })
            }
            Some(other) => Err(CodecError::UnknownEvent(other.to_string())),
            None => Err(CodecError::UnknownEvent(String::new())),
        }
    }

    /// Event code of an envelope (`ev`), if present.
    #[must_use]
    pub fn event_code<'a>(&self, envelope: &'a RawValue) -> Option<&'a str> {
        serde_json::from_str::<EnvelopeHeader<'a>>(envelope.get())
            .ok()
            .and_then(|h| h.ev)
    }

    /// Recognize a control frame.
    ///
    /// Returns `None` for data frames. Control frames are a single status
    /// object or an array whose every element carries a `status`.
    #[must_use]
    pub fn control(&self, text: &str) -> Option<Vec<ControlStatus>> {
        if !text.contains("\"status\"") {
            return None;
        }
        match serde_json::from_str::<ControlFrame>(text).ok()? {
            ControlFrame::One(status) => Some(vec![status]),
            ControlFrame::Many(statuses) if !statuses.is_empty() => Some(statuses),
            ControlFrame::Many(_) => None,
        }
    }

    /// Join envelopes into one array frame.
    #[must_use]
    pub fn join<'a, I>(&self, envelopes: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = String::from("[");
        for (i, envelope) in envelopes.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(envelope);
        }
        out.push(']');
        out
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
