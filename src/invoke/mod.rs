//! Call invocation.
//!
//! A logical call is created once, registered in the correlation table and
//! driven to resolution through one or more physical attempts:
//!
//! ```text
//!   invoke() ─► Funnel ─► drive ─┬─► launch_attempt ─► Backend::invoke
//!                               │                          │ (direct)
//!                               │   ResultCollector ◄──────┘ (queued: poll)
//!                               │          │
//!                               └─◄ CorrelationTable::complete / report_failure
//! ```
//!
//! The driver owns retry decisions: retryable failures, speculative retries
//! for stragglers and re-enqueueing queued calls no worker picked up. The
//! first successful response wins; later duplicates are dropped.

mod call;
mod collector;
mod pending;
mod runtime;
mod speculative;
mod stats;

pub use call::{Call, Outcome, RemoteError, Return};
pub use collector::{adaptive_concurrency, dispatch, ResultCollector};
pub use pending::{Completion, CorrelationTable, FailureReceiver, ResultReceiver};
pub use runtime::{args_digest, FunctionHandle, Runtime};
pub use speculative::{SpeculativePolicy, SpeculativeTimer};
pub use stats::{
    winning_attempt, CallLatencies, CallTimeline, FunctionStats, SkewEstimator, Statistics,
    StatsEvent, StatsRegistry, UsageBucket, UsageTracker, BILLING_GRANULARITY_MS,
};
