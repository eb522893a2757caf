//! Concurrency primitives.
//!
//! - [`Funnel`]: FIFO admission under a concurrency cap
//! - [`RateLimiter`]: token bucket start-rate limiter
//! - [`Pump`]: self-refilling background worker pool
//! - [`throttle`]: wrap a function with all of the above plus memoisation

pub mod cache;
pub mod funnel;
pub mod pump;
pub mod rate_limiter;
pub mod retry;
pub mod throttled;

pub use cache::PersistentCache;
pub use funnel::Funnel;
pub use pump::Pump;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{retry_async, RetryPolicy, MAX_BACKOFF};
pub use throttled::{throttle, Limits, Throttled};
