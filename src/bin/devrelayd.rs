//! devrelay daemon - device log sessions and viewer fan-out
//!
//! This binary runs the relay: it launches a log tool per device on demand,
//! batches its lines and streams them to every attached viewer.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! devrelayd start
//!
//! # Start the daemon (background/daemonized) with a config file
//! devrelayd start -d --config ~/.config/devrelay/config.toml
//!
//! # Stop the daemon
//! devrelayd stop
//!
//! # Check daemon status
//! devrelayd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devrelay_core::RelayConfig;
use devrelayd::fanout::ConsumerLimits;
use devrelayd::monitor::spawn_monitor_task;
use devrelayd::registry::spawn_registry;
use devrelayd::server::DaemonServer;

/// devrelay daemon - live device log relay
#[derive(Parser, Debug)]
#[command(name = "devrelayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to <config dir>/devrelay/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Config file used to locate the socket
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("devrelay")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("devrelayd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("devrelayd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    // SAFETY: signal 0 performs the permission and existence check only
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    RelayConfig::load(path).context("Failed to load configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            // Fail before forking so config errors reach the terminal
            let config = load_config(config.as_deref())?;

            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'devrelayd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let config = load_config(config.as_deref())?;
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                if let Some(dir) = &config.mirror_dir {
                    println!("Mirror dir: {}", dir.display());
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("devrelayd=info".parse()?)
                .add_directive("devrelay_core=info".parse()?)
                .add_directive("devrelay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "devrelay daemon starting"
    );
    info!(
        command = ?config.command,
        ring_capacity = config.ring_capacity,
        batch_interval_ms = config.batch_interval_ms,
        mirror_dir = ?config.mirror_dir,
        "Configuration loaded"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let socket_path = config.socket_path.clone();
    let limits = ConsumerLimits::from_config(&config);

    let registry = spawn_registry(config);
    info!("Session registry started");

    let _monitor_handle = spawn_monitor_task(registry.clone(), cancel_token.clone());
    info!("Process monitor started");

    let server = DaemonServer::new(socket_path.clone(), registry, cancel_token)
        .with_consumer_limits(limits);

    info!(socket = %socket_path.display(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("devrelay daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
