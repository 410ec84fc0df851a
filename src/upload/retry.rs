//! Bounded exponential backoff shared by uploads and downloads.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classifies an error for the retry loop.
pub trait RetryClass {
    /// Whether trying again can reasonably succeed.
    fn is_transient(&self) -> bool;

    /// Server-provided minimum wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry budget: `max_attempts` total attempts, waiting `base * 2^k`
/// (capped at `max_delay`) before attempt `k + 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: usize,
    base: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    /// At least one attempt is always made.
    #[must_use]
    pub fn new(max_attempts: usize, base: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max_delay,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the retry following failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The full wait schedule: one entry per retry, `max_attempts - 1` in total.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy runs out.
///
/// The closure receives the 1-based attempt number. A `retry_after` hint on
/// the error can lengthen a wait but never shortens it. Waits never decrease
/// and never exceed the policy's `max_delay`; a hint above that cap ends the
/// loop with the error.
///
/// # Errors
///
/// Returns the last error once it is non-transient or attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass + Display,
{
    let mut attempt = 1;
    let mut last_wait = Duration::ZERO;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    label,
                    attempts = attempt,
                    error = %e,
                    "Giving up after exhausting retries"
                );
                return Err(e);
            }
            Err(e) if e.retry_after().is_some_and(|hint| hint > policy.max_delay) => {
                warn!(
                    label,
                    attempt,
                    max_delay_ms = u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Server asks to wait longer than the retry cap, giving up"
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.delay_for(attempt);
                let wait = e
                    .retry_after()
                    .map_or(backoff, |hint| hint.max(backoff))
                    .max(last_wait)
                    .min(policy.max_delay);
                last_wait = wait;
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
