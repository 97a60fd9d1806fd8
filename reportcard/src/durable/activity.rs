//! Activity execution with per-attempt timeout and retry.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 0 means retry until success or a non-retryable failure
    pub maximum_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);
        let capped = secs.min(self.maximum_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts != 0 && attempt >= self.maximum_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(5 * 60))
    }
}

impl ActivityOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ActivityError {
    #[error("{0}")]
    Retryable(String),

    #[error("{kind}: {message}")]
    NonRetryable { kind: String, message: String },

    #[error("activity timed out after {0:?}")]
    Timeout(Duration),

    #[error("activity failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ActivityError>,
    },
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ActivityError::Retryable(message.into())
    }

    pub fn non_retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ActivityError::NonRetryable {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Retryable(_) | ActivityError::Timeout(_))
    }
}

/// Run `attempt` until it succeeds, fails non-retryably, or the policy gives up.
///
/// Each attempt is bounded by `start_to_close_timeout`; a timed-out attempt
/// counts as a retryable failure.
pub async fn execute_activity<T, F, Fut>(
    name: &str,
    options: &ActivityOptions,
    mut attempt: F,
) -> Result<T, ActivityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = match tokio::time::timeout(options.start_to_close_timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(ActivityError::Timeout(options.start_to_close_timeout)),
        };

        let err = match result {
            Ok(value) => {
                debug!(activity = name, attempts, "Activity completed");
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(activity = name, attempts, error = %err, "Activity failed (non-retryable)");
            return Err(err);
        }

        if options.retry.exhausted(attempts) {
            warn!(activity = name, attempts, error = %err, "Activity retries exhausted");
            if attempts <= 1 {
                return Err(err);
            }
            return Err(ActivityError::Exhausted {
                attempts,
                last: Box::new(err),
            });
        }

        let delay = options.retry.backoff(attempts);
        warn!(
            activity = name,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "Activity attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
