//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use devrelay_core::DeviceId;
use serde::{Deserialize, Serialize};

/// Error codes carried by [`ServerMessage::Error`].
pub mod codes {
    /// The upstream log tool could not be launched.
    pub const SPAWN_FAILED: &str = "spawn_failed";
    /// The upstream log tool wrote to its error stream or failed mid-read.
    pub const UPSTREAM_ERROR: &str = "upstream_error";
    /// The daemon already runs its maximum number of device sessions.
    pub const REGISTRY_FULL: &str = "registry_full";
    /// The request referenced an invalid device id.
    pub const INVALID_DEVICE: &str = "invalid_device";
    /// The request is not valid in the connection's current state.
    pub const BAD_REQUEST: &str = "bad_request";
    /// The daemon is shutting down or its registry is unavailable.
    pub const UNAVAILABLE: &str = "unavailable";
}

/// Message types that can be sent by viewers to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake
    Connect {
        /// Client identifier (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Start streaming a device's log
    Attach {
        /// Device to attach to
        device_id: String,
    },

    /// Stop streaming the currently attached device
    Detach,

    /// Reset this viewer's view state
    Clear,

    /// List devices with an active session
    ListDevices,

    /// Ping to check connection
    Ping {
        /// Sequence number echoed in the pong
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from viewer to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a message stamped with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn attach(device_id: impl Into<String>) -> Self {
        Self::new(MessageType::Attach {
            device_id: device_id.into(),
        })
    }

    pub fn detach() -> Self {
        Self::new(MessageType::Detach)
    }

    pub fn clear() -> Self {
        Self::new(MessageType::Clear)
    }

    pub fn list_devices() -> Self {
        Self::new(MessageType::ListDevices)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Summary of one active device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    /// Number of attached viewers
    pub consumers: usize,
    /// PID of the upstream log tool, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Messages sent from daemon to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Attach succeeded; batches follow
    Attached { device_id: DeviceId },

    /// A group of log lines, oldest first
    Batch {
        device_id: DeviceId,
        lines: Vec<String>,
        /// True for the catch-up snapshot sent right after attaching
        is_backlog: bool,
    },

    /// Non-fatal error notification
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The device session ended; no further batches follow
    Stopped { device_id: DeviceId, reason: String },

    /// Acknowledges a clear request
    Cleared {},

    /// Batches were skipped because this viewer fell behind
    Dropped { batches: u64 },

    /// Active device sessions
    DeviceList { devices: Vec<DeviceSummary> },

    /// Pong response to ping
    Pong { seq: u64 },
}

impl ServerMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn attached(device_id: DeviceId) -> Self {
        Self::Attached { device_id }
    }

    /// Creates a live batch.
    pub fn batch(device_id: DeviceId, lines: Vec<String>) -> Self {
        Self::Batch {
            device_id,
            lines,
            is_backlog: false,
        }
    }

    /// Creates a backlog batch.
    pub fn backlog(device_id: DeviceId, lines: Vec<String>) -> Self {
        Self::Batch {
            device_id,
            lines,
            is_backlog: true,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    pub fn stopped(device_id: DeviceId, reason: impl Into<String>) -> Self {
        Self::Stopped {
            device_id,
            reason: reason.into(),
        }
    }

    pub fn cleared() -> Self {
        Self::Cleared {}
    }

    pub fn dropped(batches: u64) -> Self {
        Self::Dropped { batches }
    }

    pub fn device_list(devices: Vec<DeviceSummary>) -> Self {
        Self::DeviceList { devices }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Encodes the message as a single JSON line (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let json = serde_json::to_string(&ClientMessage::attach("dev-1")).unwrap();
        assert!(json.contains("\"type\":\"attach\""));
        assert!(json.contains("\"device_id\":\"dev-1\""));
        assert!(json.contains("\"protocol_version\""));
    }

    #[test]
    fn test_parse_client_message_from_raw_json() {
        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"clear"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message, MessageType::Clear);

        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"connect"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message, MessageType::Connect { client_id: None });
    }

    #[test]
    fn test_batch_wire_format() {
        let msg = ServerMessage::batch(
            DeviceId::new("dev-1"),
            vec!["A".to_string(), "B".to_string()],
        );
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"batch","device_id":"dev-1","lines":["A","B"],"is_backlog":false}"#
        );
    }

    #[test]
    fn test_cleared_is_an_empty_object() {
        let json = ServerMessage::cleared().to_json().unwrap();
        assert_eq!(json, r#"{"type":"cleared"}"#);
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerMessage::Cleared {});
    }

    #[test]
    fn test_error_code_omitted_when_absent() {
        let json = ServerMessage::error("boom").to_json().unwrap();
        assert!(!json.contains("code"));

        let json = ServerMessage::error_with_code("no tool", codes::SPAWN_FAILED)
            .to_json()
            .unwrap();
        assert!(json.contains("\"code\":\"spawn_failed\""));
    }

    #[test]
    fn test_stopped_roundtrip() {
        let msg = ServerMessage::stopped(DeviceId::new("dev-1"), "exited");
        let back: ServerMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        match back {
            ServerMessage::Stopped { device_id, reason } => {
                assert_eq!(device_id.as_str(), "dev-1");
                assert_eq!(reason, "exited");
            }
            other => panic!("Expected Stopped, got {other:?}"),
        }
    }
}
