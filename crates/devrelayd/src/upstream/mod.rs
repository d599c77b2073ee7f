//! Upstream log process ownership.
//!
//! An [`UpstreamProcess`] owns exactly one spawned device log tool. The child
//! handle never leaves this module: the rest of the daemon sees `start`,
//! `stop`, `pid` and a channel of [`UpstreamEvent`]s.
//!
//! # Tasks
//!
//! ```text
//! ┌──────────────┐  Line      ┌─────────────────┐
//! │ stdout reader│──────────▶│                 │
//! └──────────────┘            │  events (mpsc)  │──▶ session actor
//! ┌──────────────┐  Error     │                 │
//! │ stderr reader│──────────▶│                 │
//! └──────────────┘            └─────────────────┘
//! ┌──────────────┐  Exited          ▲
//! │  supervisor  │──────────────────┘
//! │ (owns Child) │◀── stop (oneshot)
//! └──────────────┘
//! ```
//!
//! The supervisor reports `Exited` only after the readers have drained, so
//! every complete line precedes the exit event.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel send failures end the sending task quietly

mod splitter;

pub use splitter::LineSplitter;

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use devrelay_core::{DeviceId, RelayConfig};

/// Capacity of the event channel between readers and the session.
///
/// A full channel suspends the readers, which in turn lets the pipe fill and
/// throttles the upstream tool instead of growing memory.
const EVENT_BUFFER: usize = 1024;

/// Bytes requested per read from the child's pipes.
const READ_CHUNK: usize = 8 * 1024;

/// Something the upstream process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// One complete, non-blank line from stdout.
    Line(String),

    /// Error-stream output or a read failure. Not fatal.
    Error(String),

    /// The process is gone; always the last event.
    Exited(ExitReason),
}

/// How the upstream process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited normally with a status code.
    Code(i32),

    /// Terminated by a signal.
    Signal(i32),

    /// The exit status could not be determined.
    Lost(String),
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::Lost(format!("{status}"))
    }

    /// True for a zero exit code.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(0) => write!(f, "exited"),
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "terminated by signal {signal}"),
            Self::Lost(detail) => write!(f, "exit status unknown: {detail}"),
        }
    }
}

/// Errors raised when launching the upstream process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream command for {device_id} is empty")]
    EmptyCommand { device_id: DeviceId },

    #[error("Failed to spawn `{program}` for {device_id}: {error}")]
    SpawnFailed {
        device_id: DeviceId,
        program: String,
        error: String,
    },
}

/// Handle to a running upstream log process.
///
/// Dropping the handle stops the process, the same as calling [`stop`](Self::stop).
#[derive(Debug)]
pub struct UpstreamProcess {
    device_id: DeviceId,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl UpstreamProcess {
    /// Spawns the configured log tool for `device_id`.
    ///
    /// Returns the handle and the receiving end of its event stream.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::EmptyCommand` if no program is configured
    /// - `UpstreamError::SpawnFailed` if the program could not be launched
    pub fn start(
        device_id: &DeviceId,
        config: &RelayConfig,
    ) -> Result<(Self, mpsc::Receiver<UpstreamEvent>), UpstreamError> {
        let argv = config.command_for(device_id);
        let (program, args) = argv.split_first().ok_or_else(|| UpstreamError::EmptyCommand {
            device_id: device_id.clone(),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UpstreamError::SpawnFailed {
                device_id: device_id.clone(),
                program: program.clone(),
                error: e.to_string(),
            })?;

        let pid = child.id();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(read_stream(
                stdout,
                StreamKind::Stdout,
                config.max_line_bytes,
                event_tx.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(read_stream(
                stderr,
                StreamKind::Stderr,
                config.max_line_bytes,
                event_tx.clone(),
            ))
        });

        info!(
            device_id = %device_id,
            pid = ?pid,
            program = %program,
            "Upstream process started"
        );

        tokio::spawn(supervise(Supervisor {
            device_id: device_id.clone(),
            child,
            pid,
            stop_rx,
            readers: [stdout_task, stderr_task],
            events: event_tx,
            grace: config.stop_grace(),
        }));

        Ok((
            Self {
                device_id: device_id.clone(),
                pid,
                stop_tx: Some(stop_tx),
            },
            event_rx,
        ))
    }

    /// Asks the process to terminate (SIGTERM, then SIGKILL after the grace period).
    ///
    /// Idempotent: returns `false` when a stop was already requested or the
    /// supervisor has already finished.
    pub fn stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => {
                let sent = tx.send(()).is_ok();
                if sent {
                    debug!(device_id = %self.device_id, pid = ?self.pid, "Upstream stop requested");
                }
                sent
            }
            None => false,
        }
    }

    /// PID of the upstream process, if the OS reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Reads one pipe to EOF, forwarding complete lines as events.
async fn read_stream<R>(
    mut reader: R,
    kind: StreamKind,
    max_line_bytes: usize,
    events: mpsc::Sender<UpstreamEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = events
                    .send(UpstreamEvent::Error(format!("failed to read {kind:?}: {e}")))
                    .await;
                break;
            }
        };

        let Some(data) = chunk.get(..read) else {
            break;
        };

        for line in splitter.feed(data) {
            let event = match kind {
                StreamKind::Stdout => UpstreamEvent::Line(line),
                StreamKind::Stderr => UpstreamEvent::Error(line),
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    let discarded = splitter.finish();
    if discarded > 0 {
        debug!(stream = ?kind, bytes = discarded, "Discarded unterminated trailing output");
    }
}

struct Supervisor {
    device_id: DeviceId,
    child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    readers: [Option<JoinHandle<()>>; 2],
    events: mpsc::Sender<UpstreamEvent>,
    grace: Duration,
}

/// Owns the child until it exits, then reports the exit after the readers drain.
async fn supervise(sup: Supervisor) {
    let Supervisor {
        device_id,
        mut child,
        pid,
        stop_rx,
        readers,
        events,
        grace,
    } = sup;

    // A dropped stop sender counts as a stop request
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => terminate(&mut child, pid, grace).await,
    };

    for reader in readers.into_iter().flatten() {
        let mut reader = reader;
        if timeout(grace, &mut reader).await.is_err() {
            // A grandchild may still hold the pipe open
            warn!(device_id = %device_id, "Upstream reader did not finish, aborting");
            reader.abort();
        }
    }

    let reason = match status {
        Ok(status) => ExitReason::from_status(status),
        Err(e) => ExitReason::Lost(e.to_string()),
    };

    info!(device_id = %device_id, pid = ?pid, reason = %reason, "Upstream process ended");

    let _ = events.send(UpstreamEvent::Exited(reason)).await;
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
            // to a child we have not yet reaped, so it cannot have been recycled.
            let result = unsafe { libc::kill(pid, libc::SIGTERM) };
            if result == 0 {
                if let Ok(status) = timeout(grace, child.wait()).await {
                    return status;
                }
                warn!(pid, "Upstream ignored SIGTERM, killing");
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, grace);

    child.kill().await?;
    child.wait().await
}
