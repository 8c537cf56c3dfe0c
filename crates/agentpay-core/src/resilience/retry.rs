//! Typed retry with capped exponential backoff.

use std::time::Duration;

use crate::error::Error;

/// Exponential-backoff retry for transient errors.
///
/// Defaults: base 1 s, multiplier 2, up to five retries, so the waits are
/// 1, 2, 4, 8, 16 s and total elapsed backoff stays within 31 s. Only
/// errors classified transient by [`Error::is_transient`] are retried;
/// guard blocks, validation failures, balance shortfalls and open
/// circuits surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First wait.
    pub base: Duration,
    /// Wait multiplier per retry.
    pub multiplier: u32,
    /// Retries after the initial attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), multiplier: 2, max_retries: 5 }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn none() -> Self {
        Self { base: Duration::from_secs(1), multiplier: 2, max_retries: 0 }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base.saturating_mul(self.multiplier.saturating_pow(retry.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails non-transiently, or exhausts the
    /// retry budget. The attempt number (1-based) is passed to each call.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retries_used = attempt - 1;
                    if !err.is_transient() || retries_used >= self.max_retries {
                        return Err(err);
                    }
                    let wait = self.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off",
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
