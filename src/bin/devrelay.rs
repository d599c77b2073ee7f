//! devrelay viewer - follow a device's log through the relay daemon
//!
//! Log lines go to stdout; status notices and diagnostics go to stderr so
//! the output can be piped.
//!
//! # Usage
//!
//! ```text
//! devrelay tail emulator-5554      # follow a device
//! devrelay tail -n 00008030-001A   # with line numbers
//! devrelay devices                 # list devices with an active session
//! devrelay ping                    # check that the daemon answers
//! ```
//!
//! While tailing, type `clear` (or `c`) and Enter to reset the view, or
//! `q` to detach.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use devrelay_client::{ClientConfig, RelayClient, TailCommand, TailEnd, View, ViewEvent};
use devrelay_core::config::SOCKET_ENV;
use devrelay_core::{DeviceId, DEFAULT_SOCKET_PATH};

// ============================================================================
// CLI Arguments
// ============================================================================

/// devrelay viewer - live device logs
#[derive(Parser, Debug)]
#[command(name = "devrelay", version, about)]
struct Args {
    /// Daemon socket (defaults to $DEVRELAY_SOCKET, then /tmp/devrelay.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a device's log
    Tail {
        /// Device identifier (UDID or emulator serial)
        device: String,

        /// Prefix each line with its number in this view
        #[arg(short = 'n', long)]
        numbers: bool,

        /// Skip the lines that were logged before attaching
        #[arg(long)]
        no_backlog: bool,
    },
    /// List devices with an active session
    Devices,
    /// Check that the daemon answers
    Ping,
}

#[derive(Debug, Clone, Copy)]
struct PrintOptions {
    numbers: bool,
    backlog: bool,
}

fn socket_path(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| {
        std::env::var(SOCKET_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries log lines only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("devrelay_client=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig {
        socket_path: socket_path(args.socket),
        ..Default::default()
    };

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted");
            shutdown_token.cancel();
        }
    });

    let mut client = RelayClient::connect(&config, &cancel_token)
        .await
        .with_context(|| format!("Is devrelayd running? ({})", config.socket_path.display()))?;

    match args.command {
        Command::Tail {
            device,
            numbers,
            no_backlog,
        } => {
            let device_id = DeviceId::parse(&device)?;
            let options = PrintOptions {
                numbers,
                backlog: !no_backlog,
            };
            tail(client, device_id, options, cancel_token).await
        }
        Command::Devices => {
            let devices = client.list_devices().await?;
            if devices.is_empty() {
                eprintln!("No active devices.");
            } else {
                println!("{:<40} {:>7} {:>8}  STARTED", "DEVICE", "VIEWERS", "PID");
                for device in devices {
                    let pid = device
                        .pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<40} {:>7} {:>8}  {}",
                        device.device_id,
                        device.consumers,
                        pid,
                        device.started_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            client.disconnect().await?;
            Ok(())
        }
        Command::Ping => {
            let elapsed = client.ping().await?;
            println!("pong from {} in {elapsed:?}", client.client_id());
            client.disconnect().await?;
            Ok(())
        }
    }
}

async fn tail(
    mut client: RelayClient,
    device_id: DeviceId,
    options: PrintOptions,
    cancel_token: CancellationToken,
) -> Result<()> {
    client.attach(&device_id).await?;
    info!(device_id = %device_id, "Tailing");

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Blocking stdin reads cannot be cancelled, so they get their own thread
    std::thread::spawn(move || read_commands(command_tx));
    let printer_handle = tokio::spawn(print_events(event_rx, options, cancel_token.clone()));

    let mut view = View::new(0);
    let end = client
        .tail(&mut view, &mut command_rx, &event_tx, &cancel_token)
        .await;

    // Lets the printer drain and finish
    drop(event_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer_handle).await;

    match end? {
        TailEnd::Stopped(reason) => {
            debug!(reason, "Session ended");
            Ok(())
        }
        TailEnd::Detached => {
            let _ = client.disconnect().await;
            Ok(())
        }
        TailEnd::Cancelled => {
            let _ = client.disconnect().await;
            Ok(())
        }
        TailEnd::Disconnected => bail!("Daemon closed the connection"),
    }
}

/// Turns stdin lines into tail commands until stdin closes.
fn read_commands(commands: mpsc::UnboundedSender<TailCommand>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let command = match line.trim() {
            "c" | "clear" => TailCommand::Clear,
            "q" | "quit" | "detach" => TailCommand::Detach,
            "" => continue,
            other => {
                eprintln!("Unknown command {other:?} (use 'clear' or 'q')");
                continue;
            }
        };
        if commands.send(command).is_err() {
            break;
        }
    }
}

/// Writes view events until the channel closes or stdout goes away.
async fn print_events(
    mut events: mpsc::UnboundedReceiver<ViewEvent>,
    options: PrintOptions,
    cancel_token: CancellationToken,
) {
    let mut stdout = tokio::io::stdout();

    while let Some(event) = events.recv().await {
        let text = match event {
            ViewEvent::Line(line) => {
                if line.backlog && !options.backlog {
                    continue;
                }
                if options.numbers {
                    format!("{:>6} {}\n", line.seq, line.text)
                } else {
                    format!("{}\n", line.text)
                }
            }
            ViewEvent::Attached { device_id } => {
                eprintln!("-- attached to {device_id} --");
                continue;
            }
            ViewEvent::Gap { batches } => {
                eprintln!("-- fell behind, skipped {batches} batch(es) --");
                continue;
            }
            ViewEvent::Cleared => {
                eprintln!("-- cleared --");
                continue;
            }
            ViewEvent::Notice { message, code } => {
                match code {
                    Some(code) => eprintln!("devrelay: {message} ({code})"),
                    None => eprintln!("devrelay: {message}"),
                }
                continue;
            }
            ViewEvent::Stopped { device_id, reason } => {
                eprintln!("-- {device_id} {reason} --");
                continue;
            }
        };

        if let Err(e) = stdout.write_all(text.as_bytes()).await {
            // Reader of a pipe went away
            warn!(error = %e, "Failed to write to stdout");
            cancel_token.cancel();
            return;
        }
        let _ = stdout.flush().await;
    }
}
