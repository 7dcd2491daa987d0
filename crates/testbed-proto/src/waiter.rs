//! Bounded, cancellable polling.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Paces a polling loop at a fixed interval until a deadline.
///
/// ```ignore
/// let mut waiter = Waiter::new(timeout, Duration::from_secs(1));
/// while waiter.tick().await {
///     if done().await {
///         return Ok(());
///     }
/// }
/// Err(timeout_error)
/// ```
///
/// The first tick returns immediately. Later ticks sleep one interval, capped
/// at the deadline, so the last attempt happens at the deadline itself.
#[derive(Debug)]
pub struct Waiter {
    started: Instant,
    deadline: Instant,
    interval: Duration,
    first: bool,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
            interval,
            first: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop waiting as soon as `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Wait for the next attempt. Returns `false` once the deadline has
    /// passed or the waiter was cancelled.
    pub async fn tick(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.first {
            self.first = false;
            return true;
        }
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let wake = (now + self.interval).min(self.deadline);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(wake) => true,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
