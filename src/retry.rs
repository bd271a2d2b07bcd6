//! Retry with backoff.
//!
//! [`with_retry`] and [`with_retry_async`] run an operation up to
//! `max_retries + 1` times. Validation errors are returned immediately; any
//! other error triggers another attempt until the policy is exhausted, after
//! which the last error is returned unchanged.
//!
//! The n-th retry (1-based) waits `retry_delay * backoff_multiplier^(n-1)`,
//! capped by `max_delay` and optionally jittered by +/- 50%.

use crate::error::DataResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How many times to retry and how long to wait in between.
///
/// Stateless; one policy can drive any number of calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait before the first retry.
    pub retry_delay: Duration,
    /// Growth factor between consecutive waits; 1.0 keeps the delay constant.
    pub backoff_multiplier: f64,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff_multiplier: 1.0,
            max_delay: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between retries.
    pub fn fixed(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            ..Self::default()
        }
    }

    /// Delay multiplied by `multiplier` after every retry.
    pub fn exponential(max_retries: u32, retry_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            retry_delay,
            backoff_multiplier: multiplier,
            ..Self::default()
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }

        let multiplier = if self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut seconds = self.retry_delay.as_secs_f64() * multiplier.powi(exponent);
        if let Some(max) = self.max_delay {
            seconds = seconds.min(max.as_secs_f64());
        }
        if !seconds.is_finite() {
            seconds = self
                .max_delay
                .map(|d| d.as_secs_f64())
                .unwrap_or(self.retry_delay.as_secs_f64());
        }

        let delay = Duration::from_secs_f64(seconds.max(0.0));
        if self.jitter { jittered(delay) } else { delay }
    }
}

/// Apply +/- 50% random jitter.
fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as f64 * 0.5) as u64;
    if spread == 0 {
        return delay;
    }
    let offset = fastrand::u64(0..=spread * 2);
    let total = delay.as_millis() as i64 + offset as i64 - spread as i64;
    Duration::from_millis(total.max(0) as u64)
}

/// Outcome of a retried operation together with the number of attempts made.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: DataResult<T>,
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn into_result(self) -> DataResult<T> {
        self.result
    }
}

/// Run a blocking operation under `policy`, sleeping the thread between attempts.
pub fn with_retry<T, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> Retried<T>
where
    F: FnMut() -> DataResult<T>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op() {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) if !err.is_retryable() || attempts > policy.max_retries => {
                return Retried {
                    result: Err(err),
                    attempts,
                };
            }
            Err(err) => {
                let delay = policy.delay_for_retry(attempts);
                log_retry(operation, attempts, policy, delay, &err);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

/// Async counterpart of [`with_retry`]; waits with `tokio::time::sleep`.
pub async fn with_retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DataResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) if !err.is_retryable() || attempts > policy.max_retries => {
                return Retried {
                    result: Err(err),
                    attempts,
                };
            }
            Err(err) => {
                let delay = policy.delay_for_retry(attempts);
                log_retry(operation, attempts, policy, delay, &err);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn log_retry(
    operation: &str,
    attempt: u32,
    policy: &RetryPolicy,
    delay: Duration,
    err: &crate::error::DataRetrievalError,
) {
    warn!(
        operation,
        attempt,
        max_attempts = policy.max_attempts(),
        delay_ms = delay.as_millis() as u64,
        kind = %err.kind(),
        error = %err,
        "Operation failed, retrying"
    );
}
