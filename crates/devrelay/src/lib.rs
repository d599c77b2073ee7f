//! devrelay viewer - client library
//!
//! This library provides what a viewer needs to follow a device's log
//! through the relay daemon.
//!
//! # Architecture
//!
//! 1. **`client`**: connects to the daemon socket, performs the handshake and
//!    attaches to a device
//! 2. **`view`**: per-viewer state (line numbering, retained history, drop
//!    counters) built from the daemon's messages
//! 3. **`error`**: `ClientError` and the crate `Result` alias
//!
//! Tailing respects a shared `CancellationToken` for graceful shutdown.

pub mod client;
pub mod error;
pub mod view;

// Re-export commonly used types
pub use client::{ClientConfig, RelayClient, TailCommand, TailEnd};
pub use error::{ClientError, Result};
pub use view::{View, ViewEvent, ViewLine};
