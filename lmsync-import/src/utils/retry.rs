//! Bounded retry with exponential backoff
//!
//! Used for LMS requests: transient failures (timeouts, 5xx, connection
//! resets) are retried up to `max_attempts` times, everything else is
//! returned immediately.

use std::time::{Duration, Instant};

/// Retry limits for one logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries; first failure is final
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out
///
/// The last error is returned unchanged when attempts are exhausted, so the
/// caller still sees a transient error class.
pub async fn retry_transient<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= max_attempts => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
