//! # faast-core - Remote Function Invocation Runtime
//!
//! Backend-agnostic runtime for invoking functions on remote workers:
//! - Concurrency funnels, rate limiters and pumps for throttling work
//! - Call correlation between requests and asynchronously delivered results
//! - Adaptive result collection from response queues
//! - Retries, speculative retries for stragglers and queued re-enqueueing
//! - Per-function latency statistics, clock skew estimation and cost estimates
//! - Garbage collection of resources left behind by dead runtime instances
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!   invoke() ─►   │               Runtime                    │
//!                 │  ┌────────┐  ┌────────────┐  ┌─────────┐ │
//!                 │  │ Funnel │─►│ Call driver│─►│ Backend │─┼─► workers
//!                 │  └────────┘  └────────────┘  └─────────┘ │
//!                 │  ┌────────────────┐ ┌──────────────────┐ │
//!                 │  │  Correlation   │◄│ Result collector │◄┼── response queue
//!                 │  │     table      │ └──────────────────┘ │
//!                 │  └────────────────┘ ┌──────────────────┐ │
//!                 │                     │  GC coordinator  │ │
//!                 │                     └──────────────────┘ │
//!                 └──────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod gc;
pub mod invoke;
pub mod provider;
pub mod throttle;
pub mod types;

// Internal utilities
pub mod observability;

pub use gc::{GcCoordinator, ResourceInventory, SweepReport};
pub use invoke::{Call, FunctionHandle, FunctionStats, Return, Runtime};
pub use provider::{Backend, CleanupOptions, Mode, Provider};
pub use throttle::{throttle, Funnel, Limits, Pump, RateLimiter};
pub use types::{CallId, Config, Error, ErrorKind, InstanceId, Result, RuntimeOptions};
