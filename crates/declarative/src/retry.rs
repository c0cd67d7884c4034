//! Retry logic with exponential backoff for transient provider errors.

use crate::context::CancelToken;
use crate::error::ProviderError;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellation checks while backing off
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempts, base delay and factor.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed).
    ///
    /// A factor that yields a negative or NaN delay falls back to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(delay)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of the next attempt.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _: u32, _: u32, _: &ProviderError, _: Duration) {}
}

/// Execute a provider call with retry logic.
///
/// Permanent errors return immediately. Transient errors are retried with
/// exponential backoff until `max_attempts` is reached. If `cancel` trips
/// during a backoff the loop gives up with a cancelled error carrying the
/// last message. Returns the final result and the number of calls made.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> (Result<T, ProviderError>, u32)
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation() {
            Ok(value) => return (Ok(value), attempt),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return (Err(error), attempt);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        log::debug!("Attempt {attempt}/{max_attempts} failed: {error}. Retrying in {delay:?}");
        if let Some(cb) = callback {
            cb.on_retry(attempt, max_attempts, &error, delay);
        }

        if !sleep_unless_cancelled(delay, cancel) {
            log::debug!("Retry abandoned after {attempt} attempt(s): run cancelled");
            return (Err(ProviderError::cancelled(error.message)), attempt);
        }
    }
}

/// Sleep for `delay`, waking early if `cancel` trips. Returns false if cancelled.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}
