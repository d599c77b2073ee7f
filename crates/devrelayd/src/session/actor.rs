//! Session actor: owns one device's state and its upstream process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use devrelay_core::{DeviceId, RingBuffer};
use devrelay_protocol::{codes, ServerMessage};

use super::mirror::Mirror;
use super::scheduler::BatchScheduler;
use super::{SessionCommand, SessionEndReason, SessionEnded, SessionNotice, SessionStats};
use crate::fanout::{ConsumerHandle, ConsumerId, Delivery, Frame};
use crate::upstream::{ExitReason, UpstreamEvent, UpstreamProcess};

/// Everything a session actor starts with.
pub(super) struct SessionParts {
    pub device_id: DeviceId,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub ring_capacity: usize,
    pub batch_interval: Duration,
    pub mirror_path: Option<PathBuf>,
    pub upstream: UpstreamProcess,
    pub events: mpsc::Receiver<UpstreamEvent>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub notices: mpsc::UnboundedSender<SessionNotice>,
}

pub(super) struct SessionActor {
    device_id: DeviceId,
    generation: u64,
    started_at: DateTime<Utc>,

    ring: RingBuffer<String>,
    pending: Vec<String>,
    consumers: HashMap<ConsumerId, ConsumerHandle>,
    scheduler: BatchScheduler,

    mirror_path: Option<PathBuf>,
    mirror: Option<Mirror>,

    upstream: UpstreamProcess,
    events: mpsc::Receiver<UpstreamEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    notices: mpsc::UnboundedSender<SessionNotice>,

    stop_requested: bool,
    batches_sent: u64,
    deliveries_dropped: u64,
}

impl SessionActor {
    pub(super) fn new(parts: SessionParts) -> Self {
        Self {
            device_id: parts.device_id,
            generation: parts.generation,
            started_at: parts.started_at,
            ring: RingBuffer::new(parts.ring_capacity),
            pending: Vec::new(),
            consumers: HashMap::new(),
            scheduler: BatchScheduler::new(parts.batch_interval),
            mirror_path: parts.mirror_path,
            mirror: None,
            upstream: parts.upstream,
            events: parts.events,
            commands: parts.commands,
            notices: parts.notices,
            stop_requested: false,
            batches_sent: 0,
            deliveries_dropped: 0,
        }
    }

    /// Runs until the upstream process is gone, then tears down.
    pub(super) async fn run(mut self) {
        debug!(
            device_id = %self.device_id,
            generation = self.generation,
            interval_ms = self.scheduler.period().as_millis() as u64,
            "Session starting"
        );

        self.open_mirror().await;

        let mut commands_closed = false;
        let exit = loop {
            tokio::select! {
                cmd = self.commands.recv(), if !commands_closed => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle is gone; nobody can detach any more
                        commands_closed = true;
                        self.request_stop();
                    }
                },

                event = self.events.recv() => match event {
                    Some(UpstreamEvent::Line(line)) => self.handle_line(line),
                    Some(UpstreamEvent::Error(message)) => self.handle_upstream_error(&message),
                    Some(UpstreamEvent::Exited(reason)) => break Some(reason),
                    None => break None,
                },

                _ = self.scheduler.tick() => self.flush().await,
            }
        };

        self.finish(exit).await;
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::AddConsumer(consumer) => self.handle_add_consumer(consumer),
            SessionCommand::RemoveConsumer(consumer_id) => {
                if self.consumers.remove(&consumer_id).is_some() {
                    debug!(
                        device_id = %self.device_id,
                        consumer_id,
                        remaining = self.consumers.len(),
                        "Consumer removed"
                    );
                }
            }
            SessionCommand::Stop => self.request_stop(),
            SessionCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    /// Registers a consumer: `attached`, then the backlog, then live batches.
    fn handle_add_consumer(&mut self, consumer: ConsumerHandle) {
        let consumer_id = consumer.id();

        if let Some(frame) = self.encode(&ServerMessage::attached(self.device_id.clone())) {
            consumer.send_control(frame);
        }

        // Lines still pending reach this consumer with the next live batch
        let mut backlog = self.ring.snapshot();
        backlog.truncate(self.ring.len().saturating_sub(self.pending.len()));
        let backlog_len = backlog.len();

        if !backlog.is_empty() {
            if let Some(frame) = self.encode(&ServerMessage::backlog(self.device_id.clone(), backlog)) {
                consumer.send_control(frame);
            }
        }

        self.consumers.insert(consumer_id, consumer);

        debug!(
            device_id = %self.device_id,
            consumer_id,
            backlog = backlog_len,
            consumers = self.consumers.len(),
            "Consumer added"
        );
    }

    fn request_stop(&mut self) {
        if self.stop_requested {
            return;
        }
        self.stop_requested = true;
        self.upstream.stop();
        info!(device_id = %self.device_id, pid = ?self.upstream.pid(), "Session stopping");
    }

    // ========================================================================
    // Upstream Events
    // ========================================================================

    fn handle_line(&mut self, line: String) {
        self.ring.push(line.clone());
        self.pending.push(line);
    }

    fn handle_upstream_error(&mut self, message: &str) {
        warn!(device_id = %self.device_id, message, "Upstream reported an error");

        let msg = ServerMessage::error_with_code(message, codes::UPSTREAM_ERROR);
        if let Some(frame) = self.encode(&msg) {
            self.broadcast(&frame);
        }
    }

    // ========================================================================
    // Batching and Fan-out
    // ========================================================================

    /// Drains the pending queue into one batch for every consumer.
    async fn flush(&mut self) {
        let Some(lines) = BatchScheduler::drain(&mut self.pending) else {
            return;
        };

        self.write_mirror(&lines).await;

        let count = lines.len();
        let Some(frame) = self.encode(&ServerMessage::batch(self.device_id.clone(), lines)) else {
            return;
        };

        self.batches_sent += 1;
        let dropped = self.broadcast(&frame);

        debug!(
            device_id = %self.device_id,
            lines = count,
            consumers = self.consumers.len(),
            dropped,
            "Batch sent"
        );
    }

    /// Delivers a frame to every consumer, pruning closed ones.
    ///
    /// Returns how many consumers skipped it.
    fn broadcast(&mut self, frame: &Frame) -> usize {
        let mut dropped = 0;
        let mut closed = Vec::new();

        for (id, consumer) in &self.consumers {
            match consumer.deliver(frame) {
                Delivery::Delivered => {}
                Delivery::Dropped => dropped += 1,
                Delivery::Closed => closed.push(*id),
            }
        }

        for id in closed {
            self.consumers.remove(&id);
            debug!(device_id = %self.device_id, consumer_id = id, "Pruned closed consumer");

            // The registry still counts it as attached until told
            let _ = self.notices.send(SessionNotice::ConsumerClosed {
                device_id: self.device_id.clone(),
                generation: self.generation,
                consumer_id: id,
            });
        }

        self.deliveries_dropped += dropped as u64;
        dropped
    }

    fn encode(&self, msg: &ServerMessage) -> Option<Frame> {
        match msg.to_json() {
            Ok(json) => Some(Frame::from(json)),
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Failed to encode message");
                None
            }
        }
    }

    // ========================================================================
    // Mirror
    // ========================================================================

    async fn open_mirror(&mut self) {
        let Some(path) = self.mirror_path.clone() else {
            return;
        };

        match Mirror::open(path.clone()).await {
            Ok(mirror) => {
                debug!(device_id = %self.device_id, path = %path.display(), "Mirror opened");
                self.mirror = Some(mirror);
            }
            Err(e) => {
                warn!(
                    device_id = %self.device_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to open mirror, continuing without it"
                );
            }
        }
    }

    async fn write_mirror(&mut self, lines: &[String]) {
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };

        if let Err(e) = mirror.append(lines).await {
            warn!(
                device_id = %self.device_id,
                path = %mirror.path().display(),
                error = %e,
                "Mirror write failed, disabling mirror"
            );
            self.mirror = None;
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Final flush, `stopped` to every consumer, registry notification.
    ///
    /// Consumes the actor, so it runs once.
    async fn finish(mut self, exit: Option<ExitReason>) {
        self.flush().await;

        let reason = match exit {
            _ if self.stop_requested => SessionEndReason::Stopped,
            Some(reason) => SessionEndReason::Exited(reason),
            None => SessionEndReason::Lost,
        };

        // Consumers queued behind the exit still get told
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                SessionCommand::AddConsumer(consumer) => {
                    self.consumers.insert(consumer.id(), consumer);
                }
                SessionCommand::RemoveConsumer(consumer_id) => {
                    self.consumers.remove(&consumer_id);
                }
                SessionCommand::Stats { respond_to } => {
                    let _ = respond_to.send(self.stats());
                }
                SessionCommand::Stop => {}
            }
        }

        let stopped = ServerMessage::stopped(self.device_id.clone(), reason.to_string());
        if let Some(frame) = self.encode(&stopped) {
            for consumer in self.consumers.values() {
                consumer.send_control(Frame::clone(&frame));
            }
        }

        if let Some(mirror) = self.mirror.take() {
            if let Err(e) = mirror.close().await {
                warn!(device_id = %self.device_id, error = %e, "Failed to close mirror");
            }
        }

        info!(
            device_id = %self.device_id,
            generation = self.generation,
            reason = %reason,
            lines = self.ring.total_pushed(),
            batches = self.batches_sent,
            "Session ended"
        );

        let _ = self.notices.send(SessionNotice::Ended(SessionEnded {
            device_id: self.device_id.clone(),
            generation: self.generation,
            reason,
        }));
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            device_id: self.device_id.clone(),
            started_at: self.started_at,
            consumers: self.consumers.len(),
            buffered: self.ring.len(),
            pending: self.pending.len(),
            lines_total: self.ring.total_pushed(),
            batches_sent: self.batches_sent,
            deliveries_dropped: self.deliveries_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{spawn_session, SessionHandle};
    use super::*;
    use crate::fanout::{consumer_channel, ConsumerLimits, ConsumerOutbox, Outbound};
    use devrelay_core::RelayConfig;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn shell_config(script: &str) -> RelayConfig {
        RelayConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            stop_grace_ms: 500,
            batch_interval_ms: 50,
            ..Default::default()
        }
    }

    fn start(
        device: &str,
        config: &RelayConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let handle = spawn_session(DeviceId::new(device), 1, config, notice_tx).unwrap();
        (handle, notice_rx)
    }

    /// Skips consumer notices up to the end of the session.
    async fn wait_ended(notices: &mut mpsc::UnboundedReceiver<SessionNotice>) -> SessionEnded {
        loop {
            match timeout(WAIT, notices.recv()).await.unwrap().unwrap() {
                SessionNotice::Ended(ended) => return ended,
                SessionNotice::ConsumerClosed { .. } => {}
            }
        }
    }

    async fn next_message(outbox: &mut ConsumerOutbox) -> ServerMessage {
        match timeout(WAIT, outbox.next()).await.unwrap() {
            Some(Outbound::Frame(frame)) => serde_json::from_str(frame.as_str()).unwrap(),
            Some(Outbound::Dropped(n)) => ServerMessage::dropped(n),
            None => panic!("Outbox closed"),
        }
    }

    #[tokio::test]
    async fn test_lines_within_one_interval_form_one_batch() {
        // Lines land about 100ms in, the first tick fires at one second and
        // the process exits with nothing left pending
        let mut config = shell_config("sleep 0.1; printf 'A\\nB\\nC\\n'; sleep 1.5");
        config.batch_interval_ms = 1_000;
        let (handle, mut ended) = start("dev-1", &config);

        let (consumer, mut outbox) = consumer_channel(1, ConsumerLimits::default());
        assert!(handle.add_consumer(consumer));

        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::attached(DeviceId::new("dev-1"))
        );
        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::batch(
                DeviceId::new("dev-1"),
                vec!["A".to_string(), "B".to_string(), "C".to_string()]
            )
        );
        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::stopped(DeviceId::new("dev-1"), "exited")
        );

        let ended = wait_ended(&mut ended).await;
        assert_eq!(ended.reason, SessionEndReason::Exited(ExitReason::Code(0)));
        assert!(handle.is_finished());

        let stats = handle.stats().await;
        assert!(stats.is_none());
        assert!(timeout(WAIT, outbox.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_final_flush_on_exit() {
        // A long interval means only the exit flush can deliver the lines
        let mut config = shell_config("sleep 0.2; echo last");
        config.batch_interval_ms = 60_000;
        let (handle, _ended) = start("dev-flush", &config);

        let (consumer, mut outbox) = consumer_channel(1, ConsumerLimits::default());
        assert!(handle.add_consumer(consumer));

        assert!(matches!(
            next_message(&mut outbox).await,
            ServerMessage::Attached { .. }
        ));
        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::batch(DeviceId::new("dev-flush"), vec!["last".to_string()])
        );
        assert!(matches!(
            next_message(&mut outbox).await,
            ServerMessage::Stopped { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_stopped_sent_once() {
        let config = shell_config("while true; do sleep 1; done");
        let (handle, mut ended) = start("dev-stop", &config);

        let (consumer, mut outbox) = consumer_channel(1, ConsumerLimits::default());
        assert!(handle.add_consumer(consumer));
        assert!(matches!(
            next_message(&mut outbox).await,
            ServerMessage::Attached { .. }
        ));

        handle.stop();
        handle.stop();

        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::stopped(DeviceId::new("dev-stop"), "stopped")
        );

        let ended_msg = wait_ended(&mut ended).await;
        assert_eq!(ended_msg.reason, SessionEndReason::Stopped);

        // Stopping a finished session is a no-op
        handle.stop();
        assert!(!handle.add_consumer(consumer_channel(2, ConsumerLimits::default()).0));
        assert!(handle.stats().await.is_none());

        // The session dropped its consumer handle: no second `stopped`
        assert!(timeout(WAIT, outbox.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_consumer_gets_backlog() {
        let mut config = shell_config("for i in 1 2 3 4 5; do echo line$i; done; sleep 5");
        config.ring_capacity = 3;
        let (handle, _ended) = start("dev-backlog", &config);

        let (first, mut first_outbox) = consumer_channel(1, ConsumerLimits::default());
        assert!(handle.add_consumer(first));

        // Wait until all five lines have been delivered live
        let mut seen = 0;
        while seen < 5 {
            if let ServerMessage::Batch { lines, .. } = next_message(&mut first_outbox).await {
                seen += lines.len();
            }
        }

        let (second, mut second_outbox) = consumer_channel(2, ConsumerLimits::default());
        assert!(handle.add_consumer(second));

        assert!(matches!(
            next_message(&mut second_outbox).await,
            ServerMessage::Attached { .. }
        ));
        assert_eq!(
            next_message(&mut second_outbox).await,
            ServerMessage::backlog(
                DeviceId::new("dev-backlog"),
                vec!["line3".to_string(), "line4".to_string(), "line5".to_string()]
            )
        );

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.consumers, 2);
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.lines_total, 5);
        assert_eq!(stats.pending, 0);

        handle.stop();
    }

    #[tokio::test]
    async fn test_upstream_error_reaches_consumers() {
        let config = shell_config("sleep 0.1; echo 'device not found' >&2; sleep 0.2");
        let (handle, _ended) = start("dev-err", &config);

        let (consumer, mut outbox) = consumer_channel(1, ConsumerLimits::default());
        assert!(handle.add_consumer(consumer));
        assert!(matches!(
            next_message(&mut outbox).await,
            ServerMessage::Attached { .. }
        ));

        assert_eq!(
            next_message(&mut outbox).await,
            ServerMessage::error_with_code("device not found", codes::UPSTREAM_ERROR)
        );
        assert!(matches!(
            next_message(&mut outbox).await,
            ServerMessage::Stopped { .. }
        ));
    }

    #[tokio::test]
    async fn test_mirror_receives_lines() {
        let dir = TempDir::new().unwrap();
        let mut config = shell_config("printf 'one\\ntwo\\n'");
        config.mirror_dir = Some(dir.path().to_path_buf());
        let (_handle, mut ended) = start("dev/mirror", &config);

        wait_ended(&mut ended).await;

        let content = std::fs::read_to_string(dir.path().join("dev_mirror.log")).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_dropping_every_handle_stops_session() {
        let config = shell_config("while true; do sleep 1; done");
        let (handle, mut ended) = start("dev-orphan", &config);
        drop(handle);

        let ended = wait_ended(&mut ended).await;
        assert_eq!(ended.reason, SessionEndReason::Stopped);
    }

    #[tokio::test]
    async fn test_dropped_outbox_is_reported() {
        let config = shell_config("while true; do echo tick; sleep 0.05; done");
        let (handle, mut notices) = start("dev-gone", &config);

        let (consumer, outbox) = consumer_channel(7, ConsumerLimits::default());
        assert!(handle.add_consumer(consumer));
        drop(outbox);

        // The next batch finds the outbox gone
        match timeout(WAIT, notices.recv()).await.unwrap().unwrap() {
            SessionNotice::ConsumerClosed {
                device_id,
                generation,
                consumer_id,
            } => {
                assert_eq!(device_id, DeviceId::new("dev-gone"));
                assert_eq!(generation, 1);
                assert_eq!(consumer_id, 7);
            }
            other => panic!("Expected consumer notice, got {other:?}"),
        }
        assert_eq!(handle.stats().await.unwrap().consumers, 0);

        handle.stop();
        assert_eq!(wait_ended(&mut notices).await.reason, SessionEndReason::Stopped);
    }
}
