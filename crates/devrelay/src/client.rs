//! Daemon connection client for devrelay viewers.
//!
//! This module provides the `RelayClient` which handles:
//! - Connection to the daemon via Unix socket, with exponential backoff
//! - The protocol handshake
//! - Request/reply helpers (`attach`, `list_devices`, `ping`)
//! - Tailing an attached device into a [`View`]
//!
//! **Panic-Free Policy:** This module follows the workspace panic-free policy.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devrelay_core::{DeviceId, DEFAULT_SOCKET_PATH};
use devrelay_protocol::{codes, ClientMessage, DeviceSummary, ProtocolVersion, ServerMessage};

use crate::error::{ClientError, Result};
use crate::view::{View, ViewEvent};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the viewer client.
///
/// # Example
///
/// ```rust
/// use devrelay_client::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-relay.sock"),
///     retry_initial_delay: Duration::from_millis(200),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Identifier announced in the handshake; the daemon assigns one if unset.
    pub client_id: Option<String>,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Give up after this many attempts; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            retry_initial_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
            retry_multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

// ============================================================================
// Tail Types
// ============================================================================

/// Requests a viewer can make while tailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailCommand {
    /// Reset this viewer's view
    Clear,
    /// Stop tailing and leave the device
    Detach,
}

/// Why [`RelayClient::tail`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEnd {
    /// The device session ended with this reason.
    Stopped(String),
    /// The viewer asked to detach.
    Detached,
    /// The daemon closed the connection.
    Disconnected,
    /// The cancellation token fired.
    Cancelled,
}

// ============================================================================
// Relay Client
// ============================================================================

/// A handshaken connection to the relay daemon.
///
/// # Connection Lifecycle
///
/// 1. [`connect`](Self::connect) retries the socket with backoff, sends
///    `connect` and waits for `connected`
/// 2. [`attach`](Self::attach) waits for `attached` or the daemon's error
/// 3. [`tail`](Self::tail) folds batches into a [`View`] until the session
///    stops, the viewer detaches, or the connection drops
pub struct RelayClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    next_ping: u64,
}

impl RelayClient {
    /// Connects to the daemon and completes the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::DaemonConnection` if every attempt failed or the wait was cancelled
    /// - `ClientError::VersionMismatch` if the daemon rejected our protocol version
    pub async fn connect(config: &ClientConfig, cancel: &CancellationToken) -> Result<Self> {
        let stream = connect_with_retry(config, cancel).await?;
        Self::handshake(stream, config.client_id.clone()).await
    }

    /// Performs the handshake over an already connected stream.
    pub async fn handshake(stream: UnixStream, client_id: Option<String>) -> Result<Self> {
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            next_ping: 0,
        };

        client.send(&ClientMessage::connect(client_id)).await?;

        match client.recv().await?.ok_or(ClientError::Disconnected)? {
            ServerMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
                Ok(client)
            }
            ServerMessage::Rejected {
                reason,
                protocol_version,
            } => {
                warn!(reason, "Daemon rejected connection");
                Err(ClientError::VersionMismatch {
                    client_version: ProtocolVersion::CURRENT.to_string(),
                    daemon_version: protocol_version.to_string(),
                })
            }
            ServerMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            other => Err(ClientError::ProtocolError(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    /// Identifier the daemon knows this connection by.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one message as a JSON line.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    /// Reads the next message. Returns `None` when the daemon closed the connection.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    async fn recv_required(&mut self) -> Result<ServerMessage> {
        self.recv().await?.ok_or(ClientError::Disconnected)
    }

    /// Attaches to a device and waits for the daemon to confirm.
    ///
    /// Leftovers from a previously attached device are skipped. The backlog,
    /// if any, follows the confirmation and is picked up by [`tail`](Self::tail).
    ///
    /// # Errors
    ///
    /// - `ClientError::Daemon` with code `spawn_failed`, `registry_full` or `invalid_device`
    pub async fn attach(&mut self, device_id: &DeviceId) -> Result<()> {
        self.send(&ClientMessage::attach(device_id.as_str())).await?;

        loop {
            match self.recv_required().await? {
                ServerMessage::Attached { device_id: attached } if &attached == device_id => {
                    info!(device_id = %attached, "Attached");
                    return Ok(());
                }
                ServerMessage::Error { code, message }
                    if code.as_deref() != Some(codes::UPSTREAM_ERROR) =>
                {
                    return Err(ClientError::Daemon { message, code });
                }
                other => {
                    debug!(message = ?other, "Skipping message while attaching");
                }
            }
        }
    }

    /// Lists devices with an active session.
    pub async fn list_devices(&mut self) -> Result<Vec<DeviceSummary>> {
        self.send(&ClientMessage::list_devices()).await?;

        loop {
            match self.recv_required().await? {
                ServerMessage::DeviceList { devices } => return Ok(devices),
                ServerMessage::Error {
                    message,
                    code: Some(code),
                } if code != codes::UPSTREAM_ERROR => {
                    return Err(ClientError::Daemon {
                        message,
                        code: Some(code),
                    });
                }
                other => debug!(message = ?other, "Skipping message while listing"),
            }
        }
    }

    /// Round-trips a ping and returns the elapsed time.
    pub async fn ping(&mut self) -> Result<Duration> {
        self.next_ping = self.next_ping.wrapping_add(1);
        let seq = self.next_ping;
        let started = Instant::now();
        self.send(&ClientMessage::ping(seq)).await?;

        loop {
            match self.recv_required().await? {
                ServerMessage::Pong { seq: got } if got == seq => return Ok(started.elapsed()),
                other => debug!(message = ?other, "Skipping message while waiting for pong"),
            }
        }
    }

    /// Streams the attached device into `view`, forwarding what to show on `events`.
    ///
    /// Runs until the session stops, a [`TailCommand::Detach`] arrives, the
    /// daemon disconnects, or `cancel` fires. A closed command channel only
    /// stops command handling. Event send errors are ignored so a viewer that
    /// went away does not break the stream.
    pub async fn tail(
        &mut self,
        view: &mut View,
        commands: &mut mpsc::UnboundedReceiver<TailCommand>,
        events: &mpsc::UnboundedSender<ViewEvent>,
        cancel: &CancellationToken,
    ) -> Result<TailEnd> {
        let mut commands_open = true;
        // Survives a cancelled read: `read_line` keeps partial input in it
        let mut line = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tail cancelled");
                    return Ok(TailEnd::Cancelled);
                }

                command = commands.recv(), if commands_open => match command {
                    Some(TailCommand::Clear) => self.send(&ClientMessage::clear()).await?,
                    Some(TailCommand::Detach) => {
                        self.send(&ClientMessage::detach()).await?;
                        return Ok(TailEnd::Detached);
                    }
                    None => commands_open = false,
                },

                read = self.reader.read_line(&mut line) => {
                    if read? == 0 {
                        info!("Daemon closed connection");
                        return Ok(TailEnd::Disconnected);
                    }

                    let text = std::mem::take(&mut line);
                    let message: ServerMessage = match serde_json::from_str(text.trim_end()) {
                        Ok(message) => message,
                        Err(e) => {
                            // Don't disconnect on a single bad line
                            warn!(error = %e, "Failed to parse daemon message");
                            continue;
                        }
                    };

                    // A `stopped` for a device the view left behind yields no event
                    let mut stopped = None;
                    for event in view.apply(message) {
                        if let ViewEvent::Stopped { reason, .. } = &event {
                            stopped = Some(reason.clone());
                        }
                        let _ = events.send(event);
                    }

                    if let Some(reason) = stopped {
                        return Ok(TailEnd::Stopped(reason));
                    }
                }
            }
        }
    }

    /// Says goodbye and closes the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Attempts to connect to the daemon with exponential backoff.
///
/// Starts at `retry_initial_delay` and caps at `retry_max_delay`.
async fn connect_with_retry(config: &ClientConfig, cancel: &CancellationToken) -> Result<UnixStream> {
    let mut delay = config.retry_initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        debug!(
            attempt,
            socket_path = %config.socket_path.display(),
            "Attempting to connect to daemon"
        );

        let last_error = if !config.socket_path.exists() {
            "socket not found".to_string()
        } else {
            match UnixStream::connect(&config.socket_path).await {
                Ok(stream) => {
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Err(e) => e.to_string(),
            }
        };

        if config.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(ClientError::DaemonConnection(format!(
                "{} after {attempt} attempts: {last_error}",
                config.socket_path.display()
            )));
        }

        debug!(attempt, error = %last_error, "Connection attempt failed");

        tokio::select! {
            _ = sleep(delay) => {
                let next_delay_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
                delay = Duration::from_millis(next_delay_ms).min(config.retry_max_delay);
            }
            _ = cancel.cancelled() => {
                return Err(ClientError::DaemonConnection("cancelled".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// A scripted daemon: reads one line per expected request and answers
    /// with the given raw JSON lines.
    async fn scripted_daemon(listener: UnixListener, script: Vec<Vec<String>>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        for replies in script {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                return;
            }
            for reply in replies {
                writer.write_all(reply.as_bytes()).await.unwrap();
                writer.write_all(b"\n").await.unwrap();
            }
        }
        // Hold the connection open until the client goes away
        let mut rest = String::new();
        let _ = reader.read_line(&mut rest).await;
    }

    fn json(msg: &ServerMessage) -> String {
        msg.to_json().unwrap()
    }

    fn setup(script: Vec<Vec<String>>) -> (TempDir, ClientConfig) {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(scripted_daemon(listener, script));

        let config = ClientConfig {
            socket_path,
            client_id: Some("tester".to_string()),
            max_attempts: Some(1),
            ..Default::default()
        };
        (dir, config)
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.retry_multiplier, 2.0);
        assert_eq!(config.max_attempts, Some(5));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            socket_path: dir.path().join("missing.sock"),
            retry_initial_delay: Duration::from_millis(1),
            max_attempts: Some(3),
            ..Default::default()
        };

        let err = timeout(WAIT, RelayClient::connect(&config, &CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        match err {
            ClientError::DaemonConnection(msg) => assert!(msg.contains("after 3 attempts")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_retry_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            socket_path: dir.path().join("missing.sock"),
            retry_initial_delay: Duration::from_secs(60),
            max_attempts: None,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = timeout(WAIT, RelayClient::connect(&config, &cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::DaemonConnection(_)));
    }

    #[tokio::test]
    async fn test_handshake_and_rejection() {
        let (_dir, config) = setup(vec![vec![json(&ServerMessage::connected(
            "tester".to_string(),
        ))]]);
        let client = RelayClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.client_id(), "tester");

        let (_dir, config) = setup(vec![vec![json(&ServerMessage::rejected("too old"))]]);
        let err = RelayClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_attach_reports_daemon_error() {
        let (_dir, config) = setup(vec![
            vec![json(&ServerMessage::connected("tester".to_string()))],
            vec![json(&ServerMessage::error_with_code(
                "no such tool",
                codes::SPAWN_FAILED,
            ))],
        ]);
        let mut client = RelayClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap();

        let err = client.attach(&DeviceId::new("dev-1")).await.unwrap_err();
        assert_eq!(err.daemon_code(), Some(codes::SPAWN_FAILED));
    }

    #[tokio::test]
    async fn test_tail_until_stopped() {
        let device = DeviceId::new("dev-1");
        let (_dir, config) = setup(vec![
            vec![json(&ServerMessage::connected("tester".to_string()))],
            vec![
                json(&ServerMessage::attached(device.clone())),
                json(&ServerMessage::backlog(device.clone(), vec!["old".into()])),
                json(&ServerMessage::batch(
                    device.clone(),
                    vec!["A".into(), "B".into()],
                )),
                json(&ServerMessage::stopped(device.clone(), "exited")),
            ],
        ]);
        let mut client = RelayClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap();
        client.attach(&device).await.unwrap();

        let mut view = View::default();
        let (_cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let end = timeout(
            WAIT,
            client.tail(&mut view, &mut cmd_rx, &event_tx, &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(end, TailEnd::Stopped("exited".to_string()));

        let texts: Vec<String> = view.lines().map(|l| l.text.clone()).collect();
        assert_eq!(texts, vec!["old", "A", "B"]);
        assert_eq!(view.stopped(), Some("exited"));

        drop(event_tx);
        let mut count = 0;
        while event_rx.recv().await.is_some() {
            count += 1;
        }
        // three lines and the stop notice
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_tail_clear_then_detach() {
        let device = DeviceId::new("dev-1");
        let (_dir, config) = setup(vec![
            vec![json(&ServerMessage::connected("tester".to_string()))],
            vec![
                json(&ServerMessage::attached(device.clone())),
                json(&ServerMessage::batch(device.clone(), vec!["A".into()])),
            ],
            // reply to clear
            vec![json(&ServerMessage::cleared())],
        ]);
        let mut client = RelayClient::connect(&config, &CancellationToken::new())
            .await
            .unwrap();
        client.attach(&device).await.unwrap();

        let mut view = View::default();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        cmd_tx.send(TailCommand::Clear).unwrap();

        let cancel = CancellationToken::new();
        let tail = async {
            client
                .tail(&mut view, &mut cmd_rx, &event_tx, &cancel)
                .await
        };
        let driver = async {
            loop {
                if let Some(ViewEvent::Cleared) = event_rx.recv().await {
                    cmd_tx.send(TailCommand::Detach).unwrap();
                    break;
                }
            }
        };

        let (end, ()) = timeout(WAIT, async { tokio::join!(tail, driver) })
            .await
            .unwrap();
        assert_eq!(end.unwrap(), TailEnd::Detached);
        assert!(view.is_empty());
        assert_eq!(view.next_seq(), 1);
    }
}
