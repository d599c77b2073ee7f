//! devrelay protocol - wire messages between the daemon and viewers
//!
//! Messages are JSON objects tagged by a `type` field and exchanged as
//! newline-delimited JSON over the daemon's Unix socket.

pub mod message;
pub mod version;

pub use message::{codes, ClientMessage, DeviceSummary, MessageType, ServerMessage};
pub use version::{ProtocolVersion, VersionError};
