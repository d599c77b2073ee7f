//! devrelay core - shared types for the device log relay
//!
//! This crate provides the domain types shared between
//! the daemon (devrelayd) and the viewer client (devrelay).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod device;
pub mod error;
pub mod ring;

// Re-exports for convenience
pub use config::{ConfigError, RelayConfig, DEFAULT_SOCKET_PATH, DEVICE_PLACEHOLDER};
pub use device::DeviceId;
pub use error::{DomainError, DomainResult};
pub use ring::RingBuffer;
