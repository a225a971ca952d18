//! Wire Protocol
//!
//! JSON text protocol shared by clients, internal tiers and the vendor.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlStatus, FrameCodec};
pub use messages::{ClientCommand, CommandKind, StatusReply};

/// One outbound text frame. Cloning is cheap, so a frame built once can be
/// queued to many sessions.
pub type Frame = tokio_tungstenite::tungstenite::Utf8Bytes;
