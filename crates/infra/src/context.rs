//! Cancellation and deadlines for in-flight operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Longest single sleep while waiting, so cancellation is observed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Caller-supplied cancellation flag plus optional deadline.
///
/// Cloning shares the flag: cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` when unbounded).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Clamp `wait` to the deadline.
    pub fn bound(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(left) => wait.min(left),
            None => wait,
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(WAIT_SLICE));
        }
    }

    pub(crate) fn wait_slice() -> Duration {
        WAIT_SLICE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let ctx = OperationContext::new();
        let clone = ctx.clone();
        assert!(ctx.check().is_ok());
        clone.cancel();
        assert_eq!(ctx.check(), Err(Interrupted::Cancelled));
    }

    #[test]
    fn expired_deadline_interrupts_sleep() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        assert_eq!(ctx.sleep(Duration::from_secs(5)), Err(Interrupted::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn bound_clamps_to_deadline() {
        let unbounded = OperationContext::new();
        assert_eq!(unbounded.bound(Duration::from_secs(3)), Duration::from_secs(3));

        let bounded = OperationContext::new().with_timeout(Duration::from_millis(50));
        assert!(bounded.bound(Duration::from_secs(3)) <= Duration::from_millis(50));
    }
}
