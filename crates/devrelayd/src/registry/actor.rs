//! Registry actor - owns the device → session map and processes commands.
//!
//! The RegistryActor is the single owner of session lookup state. It receives
//! commands via an mpsc channel, hears about finished sessions on a second
//! channel, and publishes lifecycle events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use devrelay_core::{DeviceId, RelayConfig};
use devrelay_protocol::DeviceSummary;

use super::commands::{AttachOutcome, RegistryCommand, RegistryError, RegistryEvent};
use crate::fanout::{ConsumerHandle, ConsumerId};
use crate::session::{spawn_session, SessionEnded, SessionHandle, SessionNotice};

/// One live device session as seen by the registry.
struct Entry {
    handle: SessionHandle,
    consumers: HashSet<ConsumerId>,
}

/// The registry actor.
///
/// Processes commands sequentially, so looking up a device, creating its
/// session and registering the consumer happen as one step.
///
/// # Ownership
///
/// The actor owns:
/// - `entries`: device id → session handle and attached consumer ids
/// - `next_generation`: counter tagging each spawned session
///
/// A session reports pruned consumers and its own end through `notice_rx`.
/// Both are applied only if the entry's generation still matches, so a late
/// report from an old session never touches a newer one for the same device.
pub struct RegistryActor {
    config: RelayConfig,

    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Session notifications; `notice_tx` is handed to every session
    notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,

    entries: HashMap<DeviceId, Entry>,
    next_generation: u64,
    shutting_down: bool,

    /// Event publisher for lifecycle observers
    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    pub fn new(
        config: RelayConfig,
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            config,
            receiver,
            notice_rx,
            notice_tx,
            entries: HashMap::new(),
            next_generation: 0,
            shutting_down: false,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all handles dropped),
    /// then stops whatever sessions remain.
    pub async fn run(mut self) {
        info!(max_sessions = self.config.max_sessions, "Registry actor starting");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(notice) = self.notice_rx.recv() => match notice {
                    SessionNotice::ConsumerClosed {
                        device_id,
                        generation,
                        consumer_id,
                    } => self.handle_consumer_closed(&device_id, generation, consumer_id),
                    SessionNotice::Ended(ended) => self.handle_session_ended(ended),
                },
            }
        }

        let stopped = self.stop_all();
        info!(sessions = stopped, "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Attach {
                device_id,
                consumer,
                respond_to,
            } => {
                let result = self.handle_attach(device_id, consumer);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Detach {
                device_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_detach(&device_id, consumer_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::ListDevices { respond_to } => {
                let _ = respond_to.send(self.handle_list_devices());
            }
            RegistryCommand::IsActive {
                device_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.entries.contains_key(&device_id));
            }
            RegistryCommand::GetSession {
                device_id,
                respond_to,
            } => {
                let handle = self.entries.get(&device_id).map(|e| e.handle.clone());
                let _ = respond_to.send(handle);
            }
            RegistryCommand::Shutdown { respond_to } => {
                self.shutting_down = true;
                let stopped = self.stop_all();
                info!(sessions = stopped, "Registry shut down");
                let _ = respond_to.send(stopped);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_attach(
        &mut self,
        device_id: DeviceId,
        consumer: ConsumerHandle,
    ) -> Result<AttachOutcome, RegistryError> {
        if self.shutting_down {
            return Err(RegistryError::ShuttingDown);
        }

        let consumer_id = consumer.id();

        if let Some(entry) = self.entries.get_mut(&device_id) {
            if entry.handle.add_consumer(consumer.clone()) {
                entry.consumers.insert(consumer_id);
                let pid = entry.handle.pid();
                debug!(
                    device_id = %device_id,
                    consumer_id,
                    consumers = entry.consumers.len(),
                    "Consumer joined existing session"
                );
                self.publish(RegistryEvent::ConsumerAttached {
                    device_id,
                    consumer_id,
                });
                return Ok(AttachOutcome { created: false, pid });
            }

            // The session is finishing; its end report will be stale
            debug!(device_id = %device_id, "Replacing finished session");
            self.entries.remove(&device_id);
        }

        if self.entries.len() >= self.config.max_sessions {
            warn!(
                device_id = %device_id,
                current = self.entries.len(),
                max = self.config.max_sessions,
                "Registry is full, rejecting attach"
            );
            return Err(RegistryError::RegistryFull {
                max: self.config.max_sessions,
            });
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let handle = spawn_session(
            device_id.clone(),
            generation,
            &self.config,
            self.notice_tx.clone(),
        )
        .map_err(|e| {
            warn!(device_id = %device_id, error = %e, "Failed to start session");
            RegistryError::SpawnFailed {
                device_id: device_id.clone(),
                reason: e.to_string(),
            }
        })?;

        if !handle.add_consumer(consumer) {
            // Cannot happen for a task that has not run yet
            warn!(device_id = %device_id, "New session refused its first consumer");
        }

        let pid = handle.pid();
        let mut consumers = HashSet::new();
        consumers.insert(consumer_id);
        self.entries
            .insert(device_id.clone(), Entry { handle, consumers });

        info!(
            device_id = %device_id,
            generation,
            pid = ?pid,
            sessions = self.entries.len(),
            "Session created"
        );

        self.publish(RegistryEvent::SessionStarted {
            device_id: device_id.clone(),
            pid,
        });
        self.publish(RegistryEvent::ConsumerAttached {
            device_id,
            consumer_id,
        });

        Ok(AttachOutcome { created: true, pid })
    }

    fn handle_detach(&mut self, device_id: &DeviceId, consumer_id: ConsumerId) -> bool {
        let Some(entry) = self.entries.get_mut(device_id) else {
            return false;
        };

        if !entry.consumers.remove(&consumer_id) {
            return false;
        }

        entry.handle.remove_consumer(consumer_id);
        self.release_consumer(device_id, consumer_id);
        true
    }

    /// A session pruned a consumer whose connection went away without detaching.
    fn handle_consumer_closed(
        &mut self,
        device_id: &DeviceId,
        generation: u64,
        consumer_id: ConsumerId,
    ) {
        let removed = self.entries.get_mut(device_id).is_some_and(|entry| {
            entry.handle.generation() == generation && entry.consumers.remove(&consumer_id)
        });

        if removed {
            debug!(device_id = %device_id, consumer_id, "Consumer closed without detach");
            self.release_consumer(device_id, consumer_id);
        }
    }

    /// Publishes the detach of a consumer already taken out of its entry, and
    /// stops the session if it was the last one.
    fn release_consumer(&mut self, device_id: &DeviceId, consumer_id: ConsumerId) {
        let remaining = self
            .entries
            .get(device_id)
            .map_or(0, |entry| entry.consumers.len());

        if remaining == 0 {
            if let Some(entry) = self.entries.remove(device_id) {
                entry.handle.stop();
            }
            info!(device_id = %device_id, "Last consumer detached, stopping session");
        } else {
            debug!(device_id = %device_id, consumer_id, remaining, "Consumer detached");
        }

        self.publish(RegistryEvent::ConsumerDetached {
            device_id: device_id.clone(),
            consumer_id,
        });
    }

    fn handle_list_devices(&self) -> Vec<DeviceSummary> {
        let mut devices: Vec<DeviceSummary> = self
            .entries
            .iter()
            .map(|(device_id, entry)| DeviceSummary {
                device_id: device_id.clone(),
                consumers: entry.consumers.len(),
                pid: entry.handle.pid(),
                started_at: entry.handle.started_at(),
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    fn handle_session_ended(&mut self, ended: SessionEnded) {
        let current = self
            .entries
            .get(&ended.device_id)
            .is_some_and(|entry| entry.handle.generation() == ended.generation);

        if current {
            self.entries.remove(&ended.device_id);
            info!(
                device_id = %ended.device_id,
                reason = %ended.reason,
                sessions = self.entries.len(),
                "Session removed after upstream exit"
            );
        } else {
            debug!(
                device_id = %ended.device_id,
                generation = ended.generation,
                "Ignoring end of an unregistered session"
            );
        }

        self.publish(RegistryEvent::SessionEnded {
            device_id: ended.device_id,
            reason: ended.reason,
        });
    }

    /// Stops every session and clears the map.
    fn stop_all(&mut self) -> usize {
        let count = self.entries.len();
        for (device_id, entry) in self.entries.drain() {
            debug!(device_id = %device_id, "Stopping session");
            entry.handle.stop();
        }
        count
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
    }
}
