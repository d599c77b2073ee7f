//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `RegistryEvent`: Session lifecycle events published for observers

use devrelay_core::DeviceId;
use devrelay_protocol::{codes, DeviceSummary};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::fanout::{ConsumerHandle, ConsumerId};
use crate::session::{SessionEndReason, SessionHandle};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each request carries a oneshot channel for its response.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Attach a consumer to a device, creating the session if needed.
    ///
    /// # Errors
    /// - `RegistryError::SpawnFailed` if the upstream process could not start
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::ShuttingDown` after `Shutdown`
    Attach {
        device_id: DeviceId,
        consumer: ConsumerHandle,
        respond_to: oneshot::Sender<Result<AttachOutcome, RegistryError>>,
    },

    /// Detach a consumer; stops the session when it was the last one.
    ///
    /// Responds `false` when the device or consumer was unknown.
    Detach {
        device_id: DeviceId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Summaries of every active session, ordered by device id.
    ListDevices {
        respond_to: oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Whether a session exists for the device.
    IsActive {
        device_id: DeviceId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Handle to the device's session, if any.
    GetSession {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<SessionHandle>>,
    },

    /// Stop every session and refuse further attaches.
    ///
    /// Responds with the number of sessions stopped.
    Shutdown { respond_to: oneshot::Sender<usize> },
}

/// Successful attach result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// True when this attach spawned the upstream process.
    pub created: bool,
    /// PID of the upstream process
    pub pid: Option<u32>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The upstream log tool could not be launched.
    #[error("failed to start log stream for {device_id}: {reason}")]
    SpawnFailed { device_id: DeviceId, reason: String },

    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    /// The registry is shutting down.
    #[error("registry is shutting down")]
    ShuttingDown,

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Wire error code reported to viewers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailed { .. } => codes::SPAWN_FAILED,
            Self::RegistryFull { .. } => codes::REGISTRY_FULL,
            Self::ShuttingDown | Self::ChannelClosed => codes::UNAVAILABLE,
        }
    }
}

// ============================================================================
// Registry Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An upstream process was spawned for a device.
    SessionStarted {
        device_id: DeviceId,
        pid: Option<u32>,
    },

    /// A device session finished.
    SessionEnded {
        device_id: DeviceId,
        reason: SessionEndReason,
    },

    /// A consumer was attached to a device.
    ConsumerAttached {
        device_id: DeviceId,
        consumer_id: ConsumerId,
    },

    /// A consumer was detached from a device.
    ConsumerDetached {
        device_id: DeviceId,
        consumer_id: ConsumerId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::RegistryFull { max: 64 };
        assert_eq!(err.to_string(), "registry is full (max: 64 sessions)");

        let err = RegistryError::SpawnFailed {
            device_id: DeviceId::new("dev-1"),
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to start log stream for dev-1: No such file or directory"
        );

        let err = RegistryError::ChannelClosed;
        assert_eq!(err.to_string(), "response channel closed");
    }

    #[test]
    fn test_registry_error_codes() {
        let err = RegistryError::SpawnFailed {
            device_id: DeviceId::new("dev-1"),
            reason: String::new(),
        };
        assert_eq!(err.code(), "spawn_failed");
        assert_eq!(RegistryError::RegistryFull { max: 1 }.code(), "registry_full");
        assert_eq!(RegistryError::ShuttingDown.code(), "unavailable");
    }
}
