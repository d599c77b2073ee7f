//! Periodic batch timer.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Fixed-period tick source that decides when pending lines become a batch.
///
/// The first tick fires one full period after creation. A late tick delays
/// the following ones instead of bursting to catch up.
#[derive(Debug)]
pub struct BatchScheduler {
    interval: Interval,
}

impl BatchScheduler {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Waits for the next tick. Cancel-safe.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Takes every pending item at once, leaving the queue empty.
    ///
    /// Returns `None` when there is nothing to send.
    pub fn drain<T>(pending: &mut Vec<T>) -> Option<Vec<T>> {
        if pending.is_empty() {
            None
        } else {
            Some(std::mem::take(pending))
        }
    }
}
