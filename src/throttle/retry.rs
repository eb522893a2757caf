//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::types::{Error, Result};

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Decides whether a failed attempt is retried, and how long to wait first.
///
/// The predicate receives the error and the zero-based number of the attempt
/// that just failed.
#[derive(Clone)]
pub struct RetryPolicy {
    predicate: RetryPredicate,
    initial_delay: Duration,
}

impl RetryPolicy {
    /// Never retry.
    pub fn never() -> Self {
        Self::when(|_, _| false)
    }

    /// Retry any error up to `retries` times.
    pub fn attempts(retries: u32) -> Self {
        Self::when(move |_, attempt| attempt < retries)
    }

    /// Retry errors whose kind is transient, up to `retries` times.
    pub fn transient(retries: u32) -> Self {
        Self::when(move |err, attempt| err.is_retryable() && attempt < retries)
    }

    /// Retry according to a custom predicate.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Error, u32) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            initial_delay: Duration::from_secs(1),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        (self.predicate)(error, attempt)
    }

    /// Delay before retrying after `attempt` failed.
    ///
    /// `initial * 2^attempt`, stretched by a random factor in `[1, 2)`,
    /// capped at [`MAX_BACKOFF`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
        let jitter = rand::thread_rng().gen_range(1.0..2.0);
        Duration::from_secs_f64(base * jitter).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

/// Run `operation` until it succeeds or `policy` declines another attempt.
pub async fn retry_async<F, Fut, T>(mut operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!("retry_succeeded: attempts={}", attempt + 1);
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.should_retry(&err, attempt) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "attempt_failed: attempt={}, error={}, retry_in={:?}",
                    attempt + 1,
                    err,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
