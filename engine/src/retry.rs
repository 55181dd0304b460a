//! Exponential backoff for remote operations.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// Retry behaviour for remote operations.
///
/// An operation is attempted at most `max_retries + 1` times. Before retry
/// `n` (0-indexed) the policy waits `base_delay * 2^n`, capped at `max_delay`.
/// Errors that are not retryable (see [`crate::Error::is_retryable`]) end the loop
/// after the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with the default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or the retries run out.
    ///
    /// The error of the last attempt is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        tracing::info!(operation, attempts = retry + 1, "Remote operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(operation, error = %err, "Remote operation failed permanently");
                    return Err(err);
                }
                Err(err) if retry >= self.max_retries => {
                    tracing::error!(operation, attempts = retry + 1, error = %err, "Remote operation retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for_retry(retry);
                    tracing::warn!(
                        operation,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Remote operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}
