//! devrelay daemon - device log sessions and viewer fan-out
//!
//! This crate provides the daemon's building blocks:
//! - `upstream` - Spawns a device log tool and turns its output into lines
//! - `session` - Per-device actor: ring buffer, batching, mirror, consumers
//! - `fanout` - Per-viewer outbound queues with drop-on-overflow
//! - `registry` - Device → session actor with lazy creation and teardown
//! - `server` - Unix socket server for viewer connections
//! - `monitor` - Process monitoring for CPU/memory and registry load
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      devrelayd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│       RegistryActor         │    │
//! │  │ (Unix Socket)   │     │  (device → session owner)   │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │ spawn             │
//! │           │ connections                 ▼                   │
//! │  ┌────────┴────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│◀────│ SessionActor (per device)   │    │
//! │  │  + writer task  │batch│  UpstreamProcess, ring,     │    │
//! │  └─────────────────┘     │  BatchScheduler, Mirror     │    │
//! │                          └─────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod fanout;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;
pub mod upstream;
