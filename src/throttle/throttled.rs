//! Throttled function wrapper.
//!
//! [`throttle`] wraps an async function so every call goes through a
//! [`Funnel`] (concurrency and retry), an optional [`RateLimiter`], and
//! optionally a memo keyed by the JSON encoding of the arguments.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::cache::PersistentCache;
use super::funnel::Funnel;
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use super::retry::RetryPolicy;
use crate::types::Result;

/// Limits applied by [`throttle`].
#[derive(Debug, Clone)]
pub struct Limits {
    /// Concurrent calls (0 = unbounded).
    pub concurrency: usize,
    /// Calls started per second; no rate limit when `None`.
    pub rate: Option<f64>,
    /// Burst allowance of the rate limiter (defaults to 1).
    pub burst: Option<u32>,
    /// Share results between calls with equal arguments.
    pub memoize: bool,
    /// Retries per call, for any error.
    pub retry: u32,
    /// Persist successful results across processes.
    pub cache: Option<PersistentCache>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate: None,
            burst: None,
            memoize: false,
            retry: 0,
            cache: None,
        }
    }
}

type Handler<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<R>> + Send + Sync>;
type MemoEntry<R> = Shared<BoxFuture<'static, Result<R>>>;

/// A function routed through a funnel, rate limiter and memo.
pub struct Throttled<A, R> {
    handler: Handler<A, R>,
    funnel: Funnel,
    limiter: Option<RateLimiter>,
    retry: RetryPolicy,
    memo: Option<Arc<Mutex<HashMap<String, MemoEntry<R>>>>>,
    cache: Option<PersistentCache>,
}

/// Wrap `f` so calls obey `limits`.
pub fn throttle<A, R, F, Fut>(limits: Limits, f: F) -> Throttled<A, R>
where
    A: Serialize + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let limiter = limits.rate.map(|rate| {
        RateLimiter::new(RateLimitConfig {
            rate_per_second: rate,
            burst: limits.burst.unwrap_or(1),
        })
    });
    Throttled {
        handler: Arc::new(move |args| f(args).boxed()),
        funnel: Funnel::new(limits.concurrency),
        limiter,
        retry: RetryPolicy::attempts(limits.retry),
        memo: limits.memoize.then(|| Arc::new(Mutex::new(HashMap::new()))),
        cache: limits.cache,
    }
}

impl<A, R> Throttled<A, R>
where
    A: Serialize + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Call the wrapped function.
    pub async fn call(&self, args: A) -> Result<R> {
        if self.memo.is_none() && self.cache.is_none() {
            return self.run(args).await;
        }

        let key = serde_json::to_string(&args)?;
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(&key).await {
                match serde_json::from_slice(&bytes) {
                    Ok(value) => return Ok(value),
                    Err(err) => tracing::debug!("cache_entry_unreadable: error={}", err),
                }
            }
        }

        let result = match &self.memo {
            Some(memo) => {
                let shared = memo
                    .lock()
                    .entry(key.clone())
                    .or_insert_with(|| self.run(args).boxed().shared())
                    .clone();
                let result = shared.await;
                if result.is_err() {
                    memo.lock().remove(&key);
                }
                result
            }
            None => self.run(args).await,
        };

        if let (Ok(value), Some(cache)) = (&result, &self.cache) {
            match serde_json::to_vec(value) {
                Ok(bytes) => {
                    if let Err(err) = cache.set(&key, &bytes).await {
                        tracing::warn!("cache_write_failed: error={}", err);
                    }
                }
                Err(err) => tracing::warn!("cache_encode_failed: error={}", err),
            }
        }
        result
    }

    fn run(&self, args: A) -> impl Future<Output = Result<R>> + Send + 'static {
        let handler = self.handler.clone();
        let funnel = self.funnel.clone();
        let limiter = self.limiter.clone();
        let retry = self.retry.clone();
        async move {
            let attempt = || {
                let handler = handler.clone();
                let limiter = limiter.clone();
                let args = args.clone();
                async move {
                    match limiter {
                        Some(limiter) => limiter.push(move || handler(args)).await,
                        None => handler(args).await,
                    }
                }
            };
            funnel.push_with_retry(attempt, &retry).await
        }
    }

    pub fn funnel(&self) -> &Funnel {
        &self.funnel
    }

    /// Forget in-memory memoised results.
    pub fn clear_memo(&self) {
        if let Some(memo) = &self.memo {
            memo.lock().clear();
        }
    }
}

impl<A, R> fmt::Debug for Throttled<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttled")
            .field("funnel", &self.funnel)
            .field("limiter", &self.limiter)
            .field("memoize", &self.memo.is_some())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
