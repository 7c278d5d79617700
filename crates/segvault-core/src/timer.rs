//! Deadline budgets threaded through multi-step operations.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Tracks how much of a caller-supplied timeout is left. A multi-step
/// operation creates one timer up front and hands `remaining()` to each
/// stage, so the stages share a single deadline instead of each getting the
/// full timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTimer {
    deadline: Instant,
    total: Duration,
}

impl TimeoutTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            total: timeout,
        }
    }

    /// Budget left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn has_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The timeout the timer was created with.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Runs `fut` within the remaining budget.
    pub async fn run<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.total)),
        }
    }
}
