//! Rate limiting and throttling.
//!
//! Token bucket rate limiter: a task starts immediately when a token is
//! available, otherwise it waits in a FIFO queue drained by a timer that
//! sleeps exactly until the next token is due. A rate that is zero,
//! negative or not finite disables limiting.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::{Error, Result};

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained starts per second.
    pub rate_per_second: f64,
    /// Starts allowed instantaneously on a full bucket.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 10.0,
            burst: 1,
        }
    }
}

// Absorbs float drift so a timer that slept the exact wait finds its token.
const TOKEN_EPSILON: f64 = 1e-9;

// Longest single drain sleep; the drain re-checks the bucket after it.
const MAX_WAIT: Duration = Duration::from_secs(3600);

impl RateLimitConfig {
    /// Whether this config limits anything at all.
    pub fn is_limited(&self) -> bool {
        self.rate_per_second.is_finite() && self.rate_per_second > 0.0
    }
}

/// Token bucket state.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    /// `None` when unlimited.
    rate: Option<f64>,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate: config.is_limited().then_some(config.rate_per_second),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if one is available at `now`.
    fn try_take(&mut self, now: Instant) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        self.refill(now, rate);
        if self.tokens >= 1.0 - TOKEN_EPSILON {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until the next whole token is available.
    fn time_until_token(&self) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / rate)
            .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: Bucket,
    queue: VecDeque<oneshot::Sender<()>>,
    draining: bool,
}

/// Token bucket rate limiter. Cloning shares the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        if !config.is_limited() {
            tracing::warn!(
                "rate_limit_disabled: rate_per_second={}",
                config.rate_per_second
            );
        }
        Self {
            config,
            state: Arc::new(Mutex::new(LimiterState {
                bucket: Bucket::new(config, Instant::now()),
                queue: VecDeque::new(),
                draining: false,
            })),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Run `task` once a token is available.
    pub async fn push<T, F, Fut>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        task().await
    }

    /// Wait for a token.
    pub async fn acquire(&self) -> Result<()> {
        let rx = {
            let mut state = self.state.lock();
            if state.queue.is_empty() && state.bucket.try_take(Instant::now()) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            if !state.draining {
                state.draining = true;
                self.spawn_drain();
            }
            rx
        };
        rx.await
            .map_err(|_| Error::cancelled("rate limiter cleared before a token was granted"))
    }

    /// Number of tasks waiting for a token.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Drop all waiting tasks; they fail with a cancellation error.
    pub fn clear(&self) {
        self.state.lock().queue.clear();
    }

    fn spawn_drain(&self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let mut state = state.lock();
                    let now = Instant::now();
                    while !state.queue.is_empty() && state.bucket.try_take(now) {
                        let granted = state
                            .queue
                            .pop_front()
                            .map(|waiter| waiter.send(()).is_ok())
                            .unwrap_or(false);
                        if !granted {
                            // Waiter went away; return its token.
                            state.bucket.tokens += 1.0;
                        }
                    }
                    if state.queue.is_empty() {
                        state.draining = false;
                        return;
                    }
                    state.bucket.time_until_token()
                };
                tokio::time::sleep(wait).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use proptest::prelude::*;

    fn max_starts_in_window(starts: &[Instant], window: Duration) -> usize {
        let mut best = 0;
        for (i, start) in starts.iter().enumerate() {
            let count = starts[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < window)
                .count();
            best = best.max(count);
        }
        best
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: 1.0,
            burst: 3,
        });
        let begin = Instant::now();
        for _ in 0..3 {
            limiter.push(|| async { Ok(()) }).await.unwrap();
        }
        assert_eq!(Instant::now(), begin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_tasks_wait_for_tokens() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: 10.0,
            burst: 1,
        });
        let begin = Instant::now();
        let starts = join_all((0..5).map(|_| limiter.push(|| async { Ok(Instant::now()) }))).await;
        let last = starts.into_iter().map(|r| r.unwrap()).max().unwrap();
        // One immediate start, then four more at 100ms spacing.
        let elapsed = last.duration_since(begin);
        assert!(elapsed >= Duration::from_millis(399), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(450), "elapsed {:?}", elapsed);
        assert_eq!(limiter.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_per_window_bounded() {
        let config = RateLimitConfig {
            rate_per_second: 5.0,
            burst: 2,
        };
        let limiter = RateLimiter::new(config);
        let results = join_all((0..30).map(|_| limiter.push(|| async { Ok(Instant::now()) }))).await;
        let mut starts: Vec<Instant> = results.into_iter().map(|r| r.unwrap()).collect();
        starts.sort();
        let bound = config.rate_per_second as usize + config.burst as usize;
        assert!(max_starts_in_window(&starts, Duration::from_secs(1)) <= bound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: 100.0,
            burst: 1,
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        join_all((0..6).map(|i| {
            let order = order.clone();
            limiter.push(move || async move {
                order.lock().push(i);
                Ok(())
            })
        }))
        .await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_waiters() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: 0.001,
            burst: 1,
        });
        limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.clear();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_rates_disable_limiting() {
        for rate in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let limiter = RateLimiter::new(RateLimitConfig {
                rate_per_second: rate,
                burst: 1,
            });
            let begin = Instant::now();
            for _ in 0..5 {
                tokio::time::timeout(Duration::from_millis(10), limiter.acquire())
                    .await
                    .unwrap_or_else(|_| panic!("rate {rate} blocked"))
                    .unwrap();
            }
            assert_eq!(Instant::now(), begin, "rate {rate}");
            assert_eq!(limiter.queued_len(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_waits_are_capped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: f64::MIN_POSITIVE,
            burst: 1,
        });
        limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.clear();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Cancelled);

        // The drain task survived its oversized wait and still serves waiters.
        let next = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!next.is_finished());
        limiter.clear();
        let err = next.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Cancelled);
    }

    #[test]
    fn test_time_until_token_is_bounded() {
        let mut bucket = Bucket::new(
            RateLimitConfig {
                rate_per_second: 1e-300,
                burst: 1,
            },
            Instant::now(),
        );
        assert!(bucket.try_take(Instant::now()));
        assert_eq!(bucket.time_until_token(), MAX_WAIT);

        let unlimited = Bucket::new(
            RateLimitConfig {
                rate_per_second: 0.0,
                burst: 1,
            },
            Instant::now(),
        );
        assert_eq!(unlimited.time_until_token(), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_bucket_window_bound(
            rate in 1u32..20,
            burst in 1u32..5,
            gaps in proptest::collection::vec(0u64..400, 1..120),
        ) {
            let origin = Instant::now();
            let mut bucket = Bucket::new(
                RateLimitConfig { rate_per_second: f64::from(rate), burst },
                origin,
            );
            let mut now = origin;
            let mut starts = Vec::new();
            for gap in gaps {
                now += Duration::from_millis(gap);
                if bucket.try_take(now) {
                    starts.push(now);
                }
            }
            let bound = (rate + burst) as usize;
            prop_assert!(max_starts_in_window(&starts, Duration::from_secs(1)) <= bound);
        }
    }
}
