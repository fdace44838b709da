//! Exponential backoff retry for remote calls.
//!
//! Only transient failures are retried; every other kind is returned on the
//! first attempt. The updater itself never loops: work-item level retries are
//! left to reminders and the dispatcher.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::error::RemoteError;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 3 retries with 2s, 4s, 8s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    RetryTransient,
    NoRetry,
}

#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),

    /// Still failing transiently after every allowed attempt.
    ExhaustedRetries { last_error: RemoteError, attempts: u32 },

    /// Failed with a non-retriable kind.
    Failed(RemoteError),
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T, RemoteError> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::Failed(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Runs `operation`, retrying transient failures per `config`.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    policy: RetryPolicy,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    let max_attempts = if policy == RetryPolicy::NoRetry {
        1
    } else {
        config.max_retries + 1
    };

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) if !e.is_retriable() => return RetryResult::Failed(e),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: e,
                        attempts: attempt,
                    };
                }
                let delay = config.delay_for_attempt(attempt - 1);
                debug!(attempt, ?delay, error = %e, "Retrying transient remote failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
