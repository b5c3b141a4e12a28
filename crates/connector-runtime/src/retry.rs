//! Retry policy shared by outbound call sites.
//!
//! - Fixed pause, retry on any failure (downstream backend calls)
//! - Exponential backoff, retry only on retry-eligible error classes

use std::future::Future;
use std::time::Duration;

use crate::bridge::protocol::ErrorClass;

/// Errors that map onto the response taxonomy.
pub trait Classify {
    fn error_class(&self) -> ErrorClass;
}

/// Which failures are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    AnyFailure,
    /// TRANSIENT, RATE_LIMITED and TIMEOUT only.
    RetryEligible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff growth factor per attempt; 1 gives a fixed pause.
    pub multiplier: u32,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(1000), Duration::from_millis(30_000))
    }
}

impl RetryPolicy {
    /// Same pause between every attempt, retrying any failure.
    pub fn fixed(max_retries: u32, pause: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: pause,
            max_backoff: pause,
            multiplier: 1,
            retry_on: RetryOn::AnyFailure,
        }
    }

    /// Doubling backoff capped at `max_backoff`, retrying eligible classes only.
    pub fn exponential(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            multiplier: 2,
            retry_on: RetryOn::RetryEligible,
        }
    }

    /// Pause before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, class: ErrorClass) -> bool {
        match self.retry_on {
            RetryOn::AnyFailure => !class.is_success(),
            RetryOn::RetryEligible => class.is_retryable(),
        }
    }

    /// Run `op` until it succeeds, a failure is not retryable, or attempts run
    /// out. `op` receives the 0-based attempt number. Returns the last error.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let class = e.error_class();
                    if attempt >= self.max_retries || !self.should_retry(class) {
                        return Err(e);
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        error_class = %class,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
