//! Restartable one-shot timer.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Coalesces bursts of triggers into one firing.
///
/// Each `schedule` moves the deadline to `now + delay`, so the timer fires
/// once the triggers have been quiet for `delay`. Meant to be polled from a
/// `select!` loop via [`Debouncer::fired`].
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) the timer with the configured delay.
    pub fn schedule(&mut self) {
        self.schedule_after(self.delay);
    }

    /// Arm (or re-arm) the timer with an explicit delay.
    pub fn schedule_after(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Disarm. Returns true if the timer was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Completes when the deadline passes, then disarms.
    ///
    /// Never completes while unarmed. Cancel safe: dropping the future leaves
    /// the deadline in place.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
