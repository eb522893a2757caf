//! Core types for the runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (CallId, InstanceId)
//! - **Errors**: The error taxonomy with thiserror derives
//! - **Config**: Configuration structures for the runtime, GC and logging

mod config;
mod errors;
mod ids;

pub use config::{Config, GcConfig, GcMode, ObservabilityConfig, RuntimeOptions};
pub use errors::{Error, ErrorContext, ErrorKind, Result};
pub use ids::{CallId, InstanceId};
