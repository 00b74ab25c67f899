//! Silence detection for worker processes.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Fires when no activity has been seen for `timeout`. Uses tokio's
/// monotonic clock.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Instant,
}

impl Watchdog {
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Record activity; the window starts over.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves at the current deadline.
    pub async fn expired(&self) {
        sleep_until(self.deadline).await;
    }
}
