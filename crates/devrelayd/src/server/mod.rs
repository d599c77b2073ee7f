//! Unix socket server for the relay daemon.
//!
//! The server:
//! - Listens on a Unix socket for viewer connections
//! - Spawns a ConnectionHandler for each viewer
//! - Stops every device session on shutdown
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  attach/detach  ┌─────────────────┐
//! │ConnectionHandler│────────────────▶│  RegistryHandle │
//! │   (per viewer)  │                 └────────┬────────┘
//! └───────┬─────────┘                          │
//!         │ ConsumerOutbox                     ▼
//!         ▼                           ┌─────────────────┐
//! ┌─────────────────┐    batches      │ Device sessions │
//! │  writer task    │◀────────────────│                 │
//! └─────────────────┘                 └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, DEFAULT_READ_TIMEOUT, MAX_MESSAGE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devrelay_core::DEFAULT_SOCKET_PATH;
use devrelay_protocol::ServerMessage;

use crate::fanout::ConsumerLimits;
use crate::registry::RegistryHandle;

/// Maximum number of concurrent viewer connections
pub const MAX_CONNECTIONS: usize = 256;

/// Unix socket server for the relay daemon.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// Outbound thresholds applied to every viewer
    limits: ConsumerLimits,

    /// How long an unattached viewer may stay silent
    read_timeout: Duration,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating client and consumer IDs
    connection_counter: AtomicU64,

    /// Connections currently open
    active_connections: Arc<AtomicUsize>,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Path where the Unix socket will be created
    /// * `registry` - Handle to the session registry
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        socket_path: impl Into<PathBuf>,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            registry,
            limits: ConsumerLimits::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a server with the default socket path.
    pub fn with_default_path(registry: RegistryHandle, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, registry, cancel_token)
    }

    /// Sets the per-viewer outbound thresholds.
    pub fn with_consumer_limits(mut self, limits: ConsumerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets how long a viewer that is not attached may stay silent before
    /// it is disconnected. Attached viewers are never timed out.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connections currently open.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered,
    /// then stops every device session. Does not return until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        // Remove a stale socket file left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ServerError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;

        info!(
            socket = %self.socket_path.display(),
            "Daemon server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Handles a new viewer connection by spawning a handler task.
    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let active = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if active >= MAX_CONNECTIONS {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            warn!(
                connection = connection_number,
                max = MAX_CONNECTIONS,
                "Too many connections, rejecting"
            );
            tokio::spawn(reject(stream, "Too many connections"));
            return;
        }

        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.registry.clone(),
            self.limits,
            connection_number,
            self.cancel_token.child_token(),
        )
        .with_read_timeout(self.read_timeout);
        let active_connections = Arc::clone(&self.active_connections);

        tokio::spawn(async move {
            let client_id = handler.run().await;
            active_connections.fetch_sub(1, Ordering::AcqRel);
            debug!(client_id = ?client_id, "Connection task finished");
        });
    }

    /// Performs cleanup on shutdown.
    async fn cleanup(&self) {
        match self.registry.shutdown().await {
            Ok(stopped) => info!(sessions = stopped, "Stopped device sessions"),
            Err(e) => warn!(error = %e, "Registry unavailable during shutdown"),
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Writes a single `rejected` line and closes the stream.
async fn reject(mut stream: UnixStream, reason: &'static str) {
    if let Ok(json) = ServerMessage::rejected(reason).to_json() {
        let _ = stream.write_all(json.as_bytes()).await;
        let _ = stream.write_all(b"\n").await;
    }
    let _ = stream.shutdown().await;
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}
