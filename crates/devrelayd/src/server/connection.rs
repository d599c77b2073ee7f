//! Connection handler for individual viewer connections.
//!
//! Each viewer connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Attaches and detaches the connection's consumer through the registry
//! - Hands every outgoing message to the connection's writer task
//!
//! All writes, replies included, go through the consumer outbox, so replies
//! and batches reach the socket in the order they were queued.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devrelay_core::DeviceId;
use devrelay_protocol::{codes, ClientMessage, MessageType, ProtocolVersion, ServerMessage};

use crate::fanout::{consumer_channel, ConsumerHandle, ConsumerLimits, ConsumerOutbox, Frame, Outbound};
use crate::registry::RegistryHandle;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections that are not attached (5 minutes)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single viewer.
///
/// Owns the read half; the write half belongs to a writer task that drains
/// the connection's [`ConsumerOutbox`].
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// This connection's consumer; clones are handed to sessions
    consumer: ConsumerHandle,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// Client identifier (assigned after handshake)
    client_id: Option<String>,

    /// Device this connection is attached to
    attached: Option<DeviceId>,

    /// Unique number for this connection; doubles as the consumer id
    connection_number: u64,

    /// Cancelled when the connection must close
    cancel: CancellationToken,

    /// Idle limit while not attached
    read_timeout: Duration,

    writer_task: JoinHandle<()>,
}

impl ConnectionHandler {
    /// Creates a handler and starts its writer task.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        limits: ConsumerLimits,
        connection_number: u64,
        cancel: CancellationToken,
    ) -> Self {
        let (consumer, outbox) = consumer_channel(connection_number, limits);
        let writer_task = tokio::spawn(write_outbox(
            BufWriter::new(writer),
            outbox,
            cancel.clone(),
            connection_number,
        ));

        Self {
            reader: BufReader::new(reader),
            consumer,
            registry,
            client_id: None,
            attached: None,
            connection_number,
            cancel,
            read_timeout: DEFAULT_READ_TIMEOUT,
            writer_task,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the viewer
    /// disconnects, the connection fails, or the server shuts down. Always
    /// detaches before returning.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New viewer connected");

        let cancel = self.cancel.clone();
        let handshake = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Eof),
            result = self.handle_handshake() => result,
        };

        match handshake {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Viewer handshake completed");

                if let Err(e) = self.process_messages().await {
                    debug!(client_id = ?self.client_id, error = %e, "Connection closed");
                }
            }
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
            }
        }

        self.detach_current().await;
        info!(client_id = ?self.client_id, "Viewer disconnected");

        let client_id = self.client_id.clone();
        self.close().await;
        client_id
    }

    /// Handles the initial protocol handshake.
    ///
    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(self.read_timeout, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(&ServerMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )));

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("viewer-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(&ServerMessage::connected(assigned_id));
                Ok(())
            }
            other => {
                self.send_message(&ServerMessage::error_with_code(
                    "Expected Connect message for handshake",
                    codes::BAD_REQUEST,
                ));
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Main message processing loop.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel = self.cancel.clone();
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(client_id = ?self.client_id, "Connection cancelled");
                    return Ok(());
                }
                read = self.next_message() => read,
            };

            let msg = match read {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Viewer sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(e)) => {
                    // The line was consumed whole; the stream is still in sync
                    debug!(client_id = ?self.client_id, error = %e, "Malformed message");
                    self.send_message(&ServerMessage::error_with_code(
                        &format!("Malformed message: {e}"),
                        codes::BAD_REQUEST,
                    ));
                    continue;
                }
                Err(ConnectionError::Timeout) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
                Err(e) => return Err(e),
            };

            if let ControlFlow::Disconnect = self.handle_message(msg).await {
                return Ok(());
            }
        }
    }

    /// Reads the next message.
    ///
    /// A passive viewer attached to a device may stay silent indefinitely;
    /// only unattached connections are subject to the idle timeout.
    async fn next_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        if self.attached.is_some() {
            return self.read_message().await;
        }

        match timeout(self.read_timeout, self.read_message()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Handles a single viewer message.
    async fn handle_message(&mut self, msg: ClientMessage) -> ControlFlow {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(&ServerMessage::error_with_code(
                    "Already connected",
                    codes::BAD_REQUEST,
                ));
            }

            MessageType::Attach { device_id } => {
                self.handle_attach(&device_id).await;
            }

            MessageType::Detach => {
                if self.attached.is_none() {
                    self.send_message(&ServerMessage::error_with_code(
                        "Not attached to a device",
                        codes::BAD_REQUEST,
                    ));
                }
                self.detach_current().await;
            }

            MessageType::Clear => {
                // View state lives in the viewer; the shared buffer is untouched
                debug!(client_id = ?self.client_id, "Viewer cleared its view");
                self.send_message(&ServerMessage::cleared());
            }

            MessageType::ListDevices => {
                let devices = self.registry.list_devices().await;
                self.send_message(&ServerMessage::device_list(devices));
            }

            MessageType::Ping { seq } => {
                self.send_message(&ServerMessage::pong(seq));
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Viewer requested disconnect");
                return ControlFlow::Disconnect;
            }
        }

        ControlFlow::Continue
    }

    /// Attaches to `raw_id`, first leaving any device already attached.
    async fn handle_attach(&mut self, raw_id: &str) {
        let device_id = match DeviceId::parse(raw_id) {
            Ok(id) => id,
            Err(e) => {
                self.send_message(&ServerMessage::error_with_code(
                    &e.to_string(),
                    codes::INVALID_DEVICE,
                ));
                return;
            }
        };

        self.detach_current().await;

        match self.registry.attach(device_id.clone(), self.consumer.clone()).await {
            Ok(outcome) => {
                info!(
                    client_id = ?self.client_id,
                    device_id = %device_id,
                    created = outcome.created,
                    pid = ?outcome.pid,
                    "Viewer attached"
                );
                // `attached` and the backlog come from the session itself
                self.attached = Some(device_id);
            }
            Err(e) => {
                warn!(
                    client_id = ?self.client_id,
                    device_id = %device_id,
                    error = %e,
                    "Attach failed"
                );
                self.send_message(&ServerMessage::error_with_code(&e.to_string(), e.code()));
            }
        }
    }

    async fn detach_current(&mut self) {
        let Some(device_id) = self.attached.take() else {
            return;
        };

        match self.registry.detach(&device_id, self.connection_number).await {
            Ok(true) => {
                debug!(client_id = ?self.client_id, device_id = %device_id, "Viewer detached");
            }
            Ok(false) => {
                // Session already ended on its own
                debug!(client_id = ?self.client_id, device_id = %device_id, "Nothing to detach");
            }
            Err(e) => {
                warn!(client_id = ?self.client_id, device_id = %device_id, error = %e, "Detach failed");
            }
        }
    }

    /// Reads a single message from the viewer.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(MAX_MESSAGE_SIZE as u64 + 1);

        let bytes_read = limited
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Queues a reply for the writer task.
    fn send_message(&self, msg: &ServerMessage) {
        match msg.to_json() {
            Ok(json) => {
                self.consumer.send_control(Frame::from(json));
            }
            Err(e) => {
                warn!(client_id = ?self.client_id, error = %e, "Failed to serialize reply");
            }
        }
    }

    /// Lets the writer drain what is queued, then ends it.
    async fn close(self) {
        let Self {
            consumer,
            cancel,
            mut writer_task,
            ..
        } = self;

        // The writer ends once every clone of the consumer is gone
        drop(consumer);
        if timeout(WRITE_TIMEOUT, &mut writer_task).await.is_err() {
            debug!("Writer did not drain in time, cancelling");
            cancel.cancel();
            writer_task.abort();
        }
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Device the connection is attached to, if any.
    pub fn attached(&self) -> Option<&DeviceId> {
        self.attached.as_ref()
    }
}

enum ControlFlow {
    Continue,
    Disconnect,
}

/// Drains a consumer outbox onto the socket, one JSON line per item.
///
/// A failed or timed-out write cancels the connection.
async fn write_outbox(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut outbox: ConsumerOutbox,
    cancel: CancellationToken,
    connection_number: u64,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = outbox.next() => item,
        };

        let result = match item {
            Some(Outbound::Frame(frame)) => write_line(&mut writer, frame.as_bytes()).await,
            Some(Outbound::Dropped(batches)) => {
                debug!(connection = connection_number, batches, "Viewer fell behind");
                match ServerMessage::dropped(batches).to_json() {
                    Ok(json) => write_line(&mut writer, json.as_bytes()).await,
                    Err(e) => Err(ConnectionError::ParseError(e.to_string())),
                }
            }
            None => break,
        };

        if let Err(e) = result {
            debug!(connection = connection_number, error = %e, "Write failed, closing connection");
            cancel.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line(
    writer: &mut BufWriter<OwnedWriteHalf>,
    bytes: &[u8],
) -> Result<(), ConnectionError> {
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(bytes).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
