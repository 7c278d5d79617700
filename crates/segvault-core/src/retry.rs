//! Exponential backoff for operations that can lose benign races.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exponential backoff schedule: `initial_delay * multiplier^(attempt - 1)`,
/// capped at `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_attempts: usize,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn exp_backoff(
        initial_delay: Duration,
        multiplier: u32,
        max_attempts: usize,
        max_delay: Duration,
    ) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_attempts,
            max_delay,
        }
    }

    /// Delay to sleep after the given 1-based attempt fails.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        self.multiplier
            .checked_pow(exp)
            .map(|factor| self.initial_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out. `should_retry` decides which errors are worth
    /// another attempt; the last error is returned as-is.
    pub async fn run<T, F, Fut, P>(&self, mut should_retry: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut(&Error) -> bool,
    {
        let mut attempt = 1usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && should_retry(&err) => {
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
