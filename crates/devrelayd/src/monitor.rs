//! Resource monitoring for the relay daemon.
//!
//! Periodically samples:
//! - CPU and memory of the daemon process itself
//! - memory of every upstream log process
//! - registry load (sessions and attached viewers)
//!
//! and logs registry lifecycle events as they happen.
//!
//! # Panic-Free Guarantees
//!
//! All code follows the workspace panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Uses pattern matching and `unwrap_or` for fallible operations

use std::process;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devrelay_protocol::DeviceSummary;

use crate::registry::{RegistryEvent, RegistryHandle};

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 100;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// How often to sample metrics.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Current process metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    /// Memory usage in bytes
    pub memory_bytes: u64,

    /// Memory usage in megabytes (convenience)
    pub memory_mb: u64,

    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,

    /// Whether memory is above threshold
    pub memory_high: bool,

    /// Whether CPU is above threshold
    pub cpu_high: bool,
}

impl ProcessMetrics {
    /// Returns true if any metric is above its threshold.
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Registry load at one sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryLoad {
    /// Active device sessions
    pub sessions: usize,

    /// Viewers attached across all sessions
    pub consumers: usize,

    /// Upstream processes with a known PID
    pub upstream_processes: usize,

    /// Combined resident memory of upstream processes in bytes
    pub upstream_memory_bytes: u64,
}

/// Process monitor for tracking daemon resource usage.
///
/// Uses the `sysinfo` crate to query process metrics.
/// The monitor must be refreshed before reading metrics.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    /// Creates a new process monitor for the current process.
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    /// Creates a process monitor with custom thresholds.
    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and returns the daemon's metrics.
    ///
    /// CPU usage is relative to the previous refresh, so the first call
    /// after creation reports 0%.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // refresh_all() is required for CPU calculation to work
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let memory_mb = memory_bytes / 1024 / 1024;
        let memory_high = memory_mb > self.memory_threshold_mb;
        let cpu_high = cpu_percent > self.cpu_threshold_percent;

        ProcessMetrics {
            memory_bytes,
            memory_mb,
            cpu_percent,
            memory_high,
            cpu_high,
        }
    }

    /// Summarizes registry load using the process table from the last refresh.
    pub fn registry_load(&self, devices: &[DeviceSummary]) -> RegistryLoad {
        let mut load = RegistryLoad {
            sessions: devices.len(),
            consumers: devices.iter().map(|d| d.consumers).sum(),
            ..Default::default()
        };

        for pid in devices.iter().filter_map(|d| d.pid) {
            if let Some(process) = self.system.process(Pid::from_u32(pid)) {
                load.upstream_processes += 1;
                load.upstream_memory_bytes += process.memory();
            }
        }

        load
    }

    /// Returns the current memory threshold in MB.
    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    /// Returns the current CPU threshold as percentage.
    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the monitoring task.
///
/// Logs resource usage every [`METRICS_INTERVAL`] and every registry event
/// as it arrives. Uses cooperative shutdown via CancellationToken.
pub fn spawn_monitor_task(
    registry: RegistryHandle,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new();
        let mut tick = interval(METRICS_INTERVAL);
        let mut events = registry.subscribe();

        // Initial refresh to establish baseline for CPU calculation
        let _ = monitor.refresh();

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = METRICS_INTERVAL.as_secs(),
            "Process monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Process monitor shutting down");
                    break;
                }

                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Monitor lagged, skipped registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Registry event channel closed");
                        break;
                    }
                },

                _ = tick.tick() => {
                    let metrics = monitor.refresh();
                    let devices = registry.list_devices().await;
                    let load = monitor.registry_load(&devices);
                    log_metrics(&metrics, &load, &monitor);
                }
            }
        }

        debug!("Process monitor task completed");
    })
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::SessionStarted { device_id, pid } => {
            info!(device_id = %device_id, pid = ?pid, "Device session started");
        }
        RegistryEvent::SessionEnded { device_id, reason } => {
            info!(device_id = %device_id, reason = %reason, "Device session ended");
        }
        RegistryEvent::ConsumerAttached {
            device_id,
            consumer_id,
        } => {
            debug!(device_id = %device_id, consumer_id, "Viewer attached");
        }
        RegistryEvent::ConsumerDetached {
            device_id,
            consumer_id,
        } => {
            debug!(device_id = %device_id, consumer_id, "Viewer detached");
        }
    }
}

/// Logs current metrics, warning if thresholds are exceeded.
fn log_metrics(metrics: &ProcessMetrics, load: &RegistryLoad, monitor: &ProcessMonitor) {
    let upstream_memory_mb = load.upstream_memory_bytes / 1024 / 1024;

    if metrics.memory_high {
        warn!(
            memory_mb = metrics.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            sessions = load.sessions,
            consumers = load.consumers,
            "HIGH MEMORY: Daemon memory usage above threshold"
        );
    } else if metrics.cpu_high {
        warn!(
            memory_mb = metrics.memory_mb,
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            threshold_percent = monitor.cpu_threshold_percent(),
            sessions = load.sessions,
            consumers = load.consumers,
            "HIGH CPU: Daemon CPU usage above threshold"
        );
    } else {
        info!(
            memory_mb = metrics.memory_mb,
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            sessions = load.sessions,
            consumers = load.consumers,
            upstream_processes = load.upstream_processes,
            upstream_memory_mb,
            "Daemon resource usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devrelay_core::DeviceId;

    #[test]
    fn test_process_metrics_default() {
        let metrics = ProcessMetrics::default();
        assert_eq!(metrics.memory_bytes, 0);
        assert_eq!(metrics.cpu_percent, 0.0);
        assert!(!metrics.is_any_high());
    }

    #[test]
    fn test_process_metrics_high_memory() {
        let metrics = ProcessMetrics {
            memory_bytes: 200 * 1024 * 1024,
            memory_mb: 200,
            cpu_percent: 10.0,
            memory_high: true,
            cpu_high: false,
        };
        assert!(metrics.is_any_high());
    }

    #[test]
    fn test_monitor_custom_thresholds() {
        let monitor = ProcessMonitor::with_thresholds(50, 50.0);
        assert_eq!(monitor.memory_threshold_mb(), 50);
        assert_eq!(monitor.cpu_threshold_percent(), 50.0);
    }

    #[test]
    fn test_monitor_refresh_returns_metrics() {
        let mut monitor = ProcessMonitor::new();
        let metrics = monitor.refresh();

        // The test process itself is alive
        assert!(metrics.memory_bytes > 0);
        assert!(metrics.cpu_percent >= 0.0);
    }

    #[test]
    fn test_registry_load_counts_live_upstreams() {
        let mut monitor = ProcessMonitor::new();
        let _ = monitor.refresh();

        let devices = vec![
            DeviceSummary {
                device_id: DeviceId::new("dev-1"),
                consumers: 2,
                // Our own PID stands in for a live upstream
                pid: Some(process::id()),
                started_at: Utc::now(),
            },
            DeviceSummary {
                device_id: DeviceId::new("dev-2"),
                consumers: 1,
                pid: None,
                started_at: Utc::now(),
            },
        ];

        let load = monitor.registry_load(&devices);
        assert_eq!(load.sessions, 2);
        assert_eq!(load.consumers, 3);
        assert_eq!(load.upstream_processes, 1);
        assert!(load.upstream_memory_bytes > 0);
    }

    #[test]
    fn test_registry_load_empty() {
        let monitor = ProcessMonitor::new();
        assert_eq!(monitor.registry_load(&[]), RegistryLoad::default());
    }
}
