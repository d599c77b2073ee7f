//! Per-consumer outbound queues with drop-on-overflow.
//!
//! Every viewer connection owns one [`ConsumerOutbox`]; sessions hold cheap
//! [`ConsumerHandle`] clones pointing at it. A handle never blocks: when the
//! viewer's queued bytes or queued messages reach their threshold, batches
//! for that viewer are skipped and counted, and the outbox reports the count
//! as a `Dropped` item so the viewer learns about the gap.
//!
//! ```text
//!  session A ──deliver()──┐
//!                         ├──▶ [unbounded mpsc + watermark] ──▶ writer task ──▶ socket
//!  connection ─control()──┘
//! ```
//!
//! Control frames (responses, backlog, `stopped`) bypass the thresholds so a
//! viewer always learns that its session ended.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use devrelay_core::RelayConfig;
use tokio::sync::{mpsc, Notify};

/// Identifier of an attached consumer, unique per daemon run.
pub type ConsumerId = u64;

/// One encoded protocol message (a JSON line without its newline).
///
/// Shared between every consumer receiving the same batch.
pub type Frame = Arc<str>;

/// Outbound thresholds for one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerLimits {
    pub max_bytes: usize,
    pub max_messages: usize,
}

impl ConsumerLimits {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_bytes: config.consumer_max_bytes,
            max_messages: config.consumer_max_messages,
        }
    }
}

impl Default for ConsumerLimits {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Result of handing one frame to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the writer.
    Delivered,
    /// Skipped because the consumer is over its threshold.
    Dropped,
    /// The consumer's connection is gone.
    Closed,
}

#[derive(Debug, Default)]
struct Watermark {
    queued_bytes: AtomicUsize,
    queued_messages: AtomicUsize,
    dropped: AtomicU64,
    dropped_total: AtomicU64,
    wake: Notify,
}

/// Sending side of a consumer's outbound queue.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    id: ConsumerId,
    connected_since: DateTime<Utc>,
    limits: ConsumerLimits,
    sender: mpsc::UnboundedSender<Frame>,
    watermark: Arc<Watermark>,
}

/// Receiving side of a consumer's outbound queue, owned by its writer.
#[derive(Debug)]
pub struct ConsumerOutbox {
    receiver: mpsc::UnboundedReceiver<Frame>,
    watermark: Arc<Watermark>,
}

/// Item yielded by [`ConsumerOutbox::next`].
#[derive(Debug)]
pub enum Outbound {
    /// A frame to write.
    Frame(OutboundFrame),
    /// This many batches were skipped since the last report.
    Dropped(u64),
}

/// A dequeued frame; still counts toward the watermark until dropped.
#[derive(Debug)]
pub struct OutboundFrame {
    frame: Frame,
    watermark: Arc<Watermark>,
}

/// Creates a connected handle/outbox pair.
pub fn consumer_channel(id: ConsumerId, limits: ConsumerLimits) -> (ConsumerHandle, ConsumerOutbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let watermark = Arc::new(Watermark::default());

    let handle = ConsumerHandle {
        id,
        connected_since: Utc::now(),
        limits,
        sender,
        watermark: Arc::clone(&watermark),
    };
    let outbox = ConsumerOutbox {
        receiver,
        watermark,
    };

    (handle, outbox)
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    /// Queues a batch frame unless the consumer is saturated.
    ///
    /// Never blocks. A skipped frame is counted and later reported through
    /// the outbox; it is not retried.
    pub fn deliver(&self, frame: &Frame) -> Delivery {
        if self.sender.is_closed() {
            return Delivery::Closed;
        }

        let bytes = self.watermark.queued_bytes.load(Ordering::Acquire);
        let messages = self.watermark.queued_messages.load(Ordering::Acquire);
        if bytes >= self.limits.max_bytes || messages >= self.limits.max_messages {
            self.watermark.dropped.fetch_add(1, Ordering::AcqRel);
            self.watermark.dropped_total.fetch_add(1, Ordering::Relaxed);
            self.watermark.wake.notify_one();
            return Delivery::Dropped;
        }

        self.enqueue(Arc::clone(frame))
    }

    /// Queues a frame regardless of thresholds.
    pub fn send_control(&self, frame: Frame) -> Delivery {
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Frame) -> Delivery {
        let len = frame.len();
        self.watermark.queued_bytes.fetch_add(len, Ordering::AcqRel);
        self.watermark.queued_messages.fetch_add(1, Ordering::AcqRel);

        if self.sender.send(frame).is_err() {
            self.watermark.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            self.watermark.queued_messages.fetch_sub(1, Ordering::AcqRel);
            return Delivery::Closed;
        }

        Delivery::Delivered
    }

    /// Bytes queued but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.watermark.queued_bytes.load(Ordering::Acquire)
    }

    /// Messages queued but not yet written.
    pub fn queued_messages(&self) -> usize {
        self.watermark.queued_messages.load(Ordering::Acquire)
    }

    /// Batches dropped over the consumer's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.watermark.dropped_total.load(Ordering::Relaxed)
    }

    /// True once the outbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl ConsumerOutbox {
    /// Waits for the next item to write.
    ///
    /// Pending drop reports take precedence over queued frames. Returns
    /// `None` once every handle has been dropped and the queue is empty.
    pub async fn next(&mut self) -> Option<Outbound> {
        loop {
            let dropped = self.watermark.dropped.swap(0, Ordering::AcqRel);
            if dropped > 0 {
                return Some(Outbound::Dropped(dropped));
            }

            tokio::select! {
                frame = self.receiver.recv() => {
                    return frame.map(|frame| {
                        Outbound::Frame(OutboundFrame {
                            frame,
                            watermark: Arc::clone(&self.watermark),
                        })
                    });
                }
                _ = self.watermark.wake.notified() => {}
            }
        }
    }
}

impl OutboundFrame {
    pub fn as_str(&self) -> &str {
        &self.frame
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.frame.as_bytes()
    }
}

impl Drop for OutboundFrame {
    fn drop(&mut self) {
        self.watermark
            .queued_bytes
            .fetch_sub(self.frame.len(), Ordering::AcqRel);
        self.watermark.queued_messages.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    async fn next_frame(outbox: &mut ConsumerOutbox) -> String {
        match timeout(Duration::from_secs(1), outbox.next()).await.unwrap() {
            Some(Outbound::Frame(f)) => f.as_str().to_string(),
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deliver_and_watermark() {
        let (handle, mut outbox) = consumer_channel(1, ConsumerLimits::default());

        assert_eq!(handle.deliver(&frame("hello")), Delivery::Delivered);
        assert_eq!(handle.queued_bytes(), 5);
        assert_eq!(handle.queued_messages(), 1);

        let item = outbox.next().await;
        assert!(matches!(item, Some(Outbound::Frame(_))));
        // Still in flight until the writer drops it
        assert_eq!(handle.queued_bytes(), 5);
        drop(item);
        assert_eq!(handle.queued_bytes(), 0);
        assert_eq!(handle.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_message_threshold_drops_and_reports() {
        let limits = ConsumerLimits {
            max_bytes: usize::MAX,
            max_messages: 2,
        };
        let (handle, mut outbox) = consumer_channel(7, limits);

        assert_eq!(handle.deliver(&frame("1")), Delivery::Delivered);
        assert_eq!(handle.deliver(&frame("2")), Delivery::Delivered);
        assert_eq!(handle.deliver(&frame("3")), Delivery::Dropped);
        assert_eq!(handle.deliver(&frame("4")), Delivery::Dropped);
        assert_eq!(handle.dropped_total(), 2);

        match outbox.next().await {
            Some(Outbound::Dropped(n)) => assert_eq!(n, 2),
            other => panic!("Expected drop report, got {other:?}"),
        }
        assert_eq!(next_frame(&mut outbox).await, "1");
        assert_eq!(next_frame(&mut outbox).await, "2");
    }

    #[tokio::test]
    async fn test_byte_threshold() {
        let limits = ConsumerLimits {
            max_bytes: 10,
            max_messages: usize::MAX,
        };
        let (handle, _outbox) = consumer_channel(1, limits);

        // Below the threshold a frame is accepted even if it overshoots
        assert_eq!(handle.deliver(&frame("0123456789abc")), Delivery::Delivered);
        assert_eq!(handle.deliver(&frame("x")), Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_control_bypasses_thresholds() {
        let limits = ConsumerLimits {
            max_bytes: 1,
            max_messages: 1,
        };
        let (handle, mut outbox) = consumer_channel(1, limits);

        assert_eq!(handle.deliver(&frame("batch")), Delivery::Delivered);
        assert_eq!(handle.send_control(frame("stopped")), Delivery::Delivered);
        assert_eq!(next_frame(&mut outbox).await, "batch");
        assert_eq!(next_frame(&mut outbox).await, "stopped");
    }

    #[tokio::test]
    async fn test_closed_outbox() {
        let (handle, outbox) = consumer_channel(1, ConsumerLimits::default());
        drop(outbox);

        assert!(handle.is_closed());
        assert_eq!(handle.deliver(&frame("x")), Delivery::Closed);
        assert_eq!(handle.send_control(frame("x")), Delivery::Closed);
        assert_eq!(handle.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_drop_report_wakes_idle_writer() {
        let limits = ConsumerLimits {
            max_bytes: usize::MAX,
            max_messages: 1,
        };
        let (handle, mut outbox) = consumer_channel(1, limits);

        assert_eq!(handle.deliver(&frame("first")), Delivery::Delivered);
        let in_flight = match outbox.next().await {
            Some(Outbound::Frame(f)) => f,
            other => panic!("Expected frame, got {other:?}"),
        };

        // Writer is busy with `in_flight`; the next batch overflows
        assert_eq!(handle.deliver(&frame("second")), Delivery::Dropped);
        drop(in_flight);

        match timeout(Duration::from_secs(1), outbox.next()).await.unwrap() {
            Some(Outbound::Dropped(1)) => {}
            other => panic!("Expected drop report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbox_ends_when_handles_dropped() {
        let (handle, mut outbox) = consumer_channel(1, ConsumerLimits::default());
        let clone = handle.clone();
        drop(handle);
        drop(clone);
        assert!(outbox.next().await.is_none());
    }
}
