//! Per-device sessions.
//!
//! A device session is an actor: one task owns the ring buffer, the pending
//! queue, the attached consumers, the optional mirror and the upstream
//! process, and multiplexes three inputs.
//!
//! ```text
//!                  ┌──────────────────────────────┐
//! SessionCommand ─▶│                              │──▶ batch ──▶ ConsumerHandle × N
//! UpstreamEvent ──▶│         SessionActor         │──▶ lines ──▶ Mirror
//! scheduler tick ─▶│                              │──▶ SessionNotice ──▶ registry
//!                  └──────────────────────────────┘
//! ```
//!
//! Because every mutation happens inside that one task, the pending queue is
//! drained by exactly one tick at a time and `stopped` is sent at most once.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Command send failures mean the session already finished

mod actor;
mod mirror;
mod scheduler;

pub use mirror::Mirror;
pub use scheduler::BatchScheduler;

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use devrelay_core::{DeviceId, RelayConfig};

use crate::fanout::{ConsumerHandle, ConsumerId};
use crate::upstream::{ExitReason, UpstreamError, UpstreamProcess};

use actor::{SessionActor, SessionParts};

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Start delivering to a consumer; sends `attached` and the backlog first.
    AddConsumer(ConsumerHandle),

    /// Stop delivering to a consumer.
    RemoveConsumer(ConsumerId),

    /// Terminate the upstream process and end the session.
    Stop,

    /// Report counters.
    Stats {
        respond_to: oneshot::Sender<SessionStats>,
    },
}

/// Point-in-time counters for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub device_id: DeviceId,
    pub started_at: DateTime<Utc>,
    pub consumers: usize,
    /// Lines currently held in the ring buffer
    pub buffered: usize,
    /// Lines read but not yet sent in a batch
    pub pending: usize,
    /// Lines read since the session started
    pub lines_total: u64,
    pub batches_sent: u64,
    /// Batch deliveries skipped because a consumer was saturated
    pub deliveries_dropped: u64,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// Stopped on request (last consumer left, or daemon shutdown).
    Stopped,

    /// The upstream process exited on its own.
    Exited(ExitReason),

    /// The upstream event stream closed without an exit status.
    Lost,
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Exited(reason) => write!(f, "{reason}"),
            Self::Lost => write!(f, "upstream lost"),
        }
    }
}

/// Notification sent to the registry when a session task finishes.
#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub device_id: DeviceId,
    /// Distinguishes this session from later ones for the same device
    pub generation: u64,
    pub reason: SessionEndReason,
}

/// What a session reports back to the registry.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// A consumer's outbox was dropped and the session stopped delivering to it.
    ConsumerClosed {
        device_id: DeviceId,
        generation: u64,
        consumer_id: ConsumerId,
    },

    /// The session task finished. Always the last notice of a session.
    Ended(SessionEnded),
}

/// Cheap-to-clone handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device_id: DeviceId,
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// PID of the upstream process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Hands a consumer to the session.
    ///
    /// Returns `false` if the session is already finishing and no longer
    /// accepts consumers. A consumer accepted here always receives either
    /// batches or `stopped`.
    pub fn add_consumer(&self, consumer: ConsumerHandle) -> bool {
        self.commands
            .send(SessionCommand::AddConsumer(consumer))
            .is_ok()
    }

    pub fn remove_consumer(&self, consumer_id: ConsumerId) {
        let _ = self
            .commands
            .send(SessionCommand::RemoveConsumer(consumer_id));
    }

    /// Requests termination. Idempotent; a no-op once the session finished.
    pub fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
    }

    /// Fetches counters, or `None` if the session has finished.
    pub async fn stats(&self) -> Option<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stats { respond_to: tx })
            .ok()?;
        rx.await.ok()
    }

    /// True once the session task stopped accepting commands.
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Starts the upstream process for `device_id` and spawns its session task.
///
/// `notices` receives a [`SessionNotice::ConsumerClosed`] for every consumer
/// pruned because its outbox went away, and exactly one
/// [`SessionNotice::Ended`] when the task finishes.
///
/// # Errors
///
/// Returns the spawn error if the upstream process could not be launched;
/// nothing is left running in that case.
pub fn spawn_session(
    device_id: DeviceId,
    generation: u64,
    config: &RelayConfig,
    notices: mpsc::UnboundedSender<SessionNotice>,
) -> Result<SessionHandle, UpstreamError> {
    let (upstream, events) = UpstreamProcess::start(&device_id, config)?;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let started_at = Utc::now();

    let handle = SessionHandle {
        device_id: device_id.clone(),
        generation,
        pid: upstream.pid(),
        started_at,
        commands: cmd_tx,
    };

    let actor = SessionActor::new(SessionParts {
        device_id,
        generation,
        started_at,
        ring_capacity: config.ring_capacity,
        batch_interval: config.batch_interval(),
        mirror_path: config.mirror_path_for(handle.device_id()),
        upstream,
        events,
        commands: cmd_rx,
        notices,
    });
    tokio::spawn(actor.run());

    Ok(handle)
}
