//! Device session registry using the Actor pattern.
//!
//! The registry maps each device id to at most one running session. It
//! receives commands via a tokio mpsc channel, so "look up, create if
//! missing, then attach" is a single step no matter how many viewers race.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │   Connections   │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                  │          ▲                  │
//!         │ RegistryCommand  │ spawn    │ SessionNotice    │ RegistryEvent
//!         │ (mpsc channel)   ▼          │                  ▼
//!    attach/detach     ┌─────────────────┐            monitor, tests
//!                      │  SessionActor   │ × devices
//!                      └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

use devrelay_core::RelayConfig;

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{AttachOutcome, RegistryCommand, RegistryError, RegistryEvent};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// The registry stops its sessions when every handle has been dropped or
/// [`RegistryHandle::shutdown`] is called.
///
/// # Example
///
/// ```no_run
/// use devrelay_core::RelayConfig;
/// use devrelayd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(RelayConfig::default());
///     let devices = handle.list_devices().await;
///     assert!(devices.is_empty());
/// }
/// ```
pub fn spawn_registry(config: RelayConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(config, cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
