//! Error types for the devrelay viewer client.
//!
//! All error types use `thiserror` for derive macros and carry enough
//! context to tell the user what to check (daemon running, versions match).
//!
//! **Panic-Free Policy:** This module follows the workspace panic-free policy.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Viewer client errors.
///
/// # Error Handling
///
/// - Connection errors suggest checking if the daemon is running
/// - Version errors mean the viewer and daemon were built from different releases
/// - `Daemon` errors are requests the daemon refused, with its error code
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to connect to the daemon.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Protocol version mismatch with daemon.
    ///
    /// Ensure the viewer and daemon are the same version.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        /// The protocol version this client speaks.
        client_version: String,
        /// The protocol version the daemon is running.
        daemon_version: String,
    },

    /// The daemon refused a request.
    #[error("Daemon error{}: {message}", code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Daemon {
        message: String,
        code: Option<String>,
    },

    /// The daemon sent something that makes no sense at this point.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon closed the connection.
    #[error("Daemon closed the connection")]
    Disconnected,

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse error passthrough.
    ///
    /// Typically indicates a version mismatch between viewer and daemon.
    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Error code reported by the daemon, if this is a refused request.
    pub fn daemon_code(&self) -> Option<&str> {
        match self {
            Self::Daemon { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
