//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to lifecycle events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{broadcast, mpsc, oneshot};

use devrelay_core::DeviceId;
use devrelay_protocol::DeviceSummary;

use super::commands::{AttachOutcome, RegistryCommand, RegistryError, RegistryEvent};
use crate::fanout::{ConsumerHandle, ConsumerId};
use crate::session::SessionHandle;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// # Usage
///
/// ```ignore
/// let (consumer, outbox) = consumer_channel(id, limits);
/// registry.attach(DeviceId::parse("dev-1")?, consumer).await?;
/// // ... drain `outbox` ...
/// registry.detach(&device_id, id).await?;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Attaches a consumer to a device, spawning its log process if needed.
    ///
    /// The session sends `attached` and, if it has history, one backlog
    /// batch to the consumer before any live batch.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SpawnFailed` if the log process could not start
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ShuttingDown` after [`shutdown`](Self::shutdown)
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn attach(
        &self,
        device_id: DeviceId,
        consumer: ConsumerHandle,
    ) -> Result<AttachOutcome, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Attach {
                device_id,
                consumer,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Detaches a consumer. Returns `false` if it was not attached there.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn detach(
        &self,
        device_id: &DeviceId,
        consumer_id: ConsumerId,
    ) -> Result<bool, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Detach {
                device_id: device_id.clone(),
                consumer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Lists active sessions.
    ///
    /// Returns an empty list if the actor is unavailable.
    pub async fn list_devices(&self) -> Vec<DeviceSummary> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ListDevices { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Whether the device currently has a session.
    pub async fn is_active(&self, device_id: &DeviceId) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::IsActive {
                device_id: device_id.clone(),
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Handle to the device's session, for stats.
    pub async fn session(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetSession {
                device_id: device_id.clone(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok().flatten()
    }

    /// Stops every session; later attaches fail with `ShuttingDown`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn shutdown(&self) -> Result<usize, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Subscribe to lifecycle events.
    ///
    /// Slow subscribers may miss events (lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the registry actor is still running.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("closed", &self.is_closed())
            .field("subscribers", &self.event_sender.receiver_count())
            .finish()
    }
}
