//! Configuration structures.
//!
//! Configuration is loaded from JSON files or strings; every section has
//! defaults so partial documents are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::Result;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Invocation pipeline options.
    #[serde(default)]
    pub runtime: RuntimeOptions,

    /// Garbage collector configuration.
    #[serde(default)]
    pub gc: GcConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Invocation pipeline options for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Maximum in-flight calls across all functions of the runtime (0 = unbounded).
    pub concurrency: usize,

    /// Retry budget per call: timeouts, dead letters and speculative attempts
    /// all draw from it.
    pub max_retries: u32,

    /// Remote execution budget per attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra time allowed for a queued response to arrive after `timeout`.
    #[serde(with = "humantime_serde")]
    pub response_grace: Duration,

    /// Memory ceiling handed to the backend.
    pub memory_size_mb: u32,

    /// Standard deviations of execution time added to the latency estimate.
    pub speculative_retry_stdevs: f64,

    /// Lower bound of the speculative retry threshold.
    #[serde(with = "humantime_serde")]
    pub speculative_retry_floor: Duration,

    /// Elapsed time must exceed the threshold by this much before re-issuing.
    #[serde(with = "humantime_serde")]
    pub speculative_retry_slack: Duration,

    /// Queued calls not acknowledged as started after this long are re-enqueued.
    #[serde(with = "humantime_serde")]
    pub queued_start_timeout: Duration,

    /// Re-enqueueing is skipped once this many calls are pending.
    pub queued_retry_backlog_threshold: usize,

    /// Maximum messages returned by one poll.
    pub collector_batch_size: usize,

    /// Floor and cap of concurrent pollers in the result collector.
    pub collector_min_concurrency: usize,
    pub collector_max_concurrency: usize,

    /// Interval of incremental statistics snapshots.
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            concurrency: 100,
            max_retries: 2,
            timeout: Duration::from_secs(60),
            response_grace: Duration::from_secs(10),
            memory_size_mb: 1024,
            speculative_retry_stdevs: 3.0,
            speculative_retry_floor: Duration::from_secs(5),
            speculative_retry_slack: Duration::from_secs(1),
            queued_start_timeout: Duration::from_secs(5),
            queued_retry_backlog_threshold: 20,
            collector_batch_size: 10,
            collector_min_concurrency: 2,
            collector_max_concurrency: 10,
            stats_interval: Duration::from_secs(1),
        }
    }
}

/// When garbage collection sweeps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Never sweep.
    Off,
    /// Sweep on every request.
    On,
    /// Sweep at most once per `auto_interval`.
    Auto,
}

/// Garbage collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub mode: GcMode,

    /// Resources younger than this many days are never collected.
    pub retention_days: u32,

    /// Minimum spacing of sweeps in auto mode.
    #[serde(with = "humantime_serde")]
    pub auto_interval: Duration,

    /// File holding the last sweep timestamp (auto mode).
    pub state_file: Option<PathBuf>,

    /// Concurrent delete work items.
    pub concurrency: usize,

    /// Delete calls per second and burst allowance. A rate that is zero,
    /// negative or not finite deletes without rate limiting.
    pub rate_per_second: f64,
    pub burst: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::Auto,
            retention_days: 1,
            auto_interval: Duration::from_secs(3600),
            state_file: None,
            concurrency: 5,
            rate_per_second: 5.0,
            burst: 1,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.max_retries, 2);
        assert_eq!(options.speculative_retry_floor, Duration::from_secs(5));
        assert_eq!(options.collector_min_concurrency, 2);
        assert_eq!(options.collector_max_concurrency, 10);

        let gc = GcConfig::default();
        assert_eq!(gc.mode, GcMode::Auto);
        assert_eq!(gc.auto_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{"runtime": {"concurrency": 8, "timeout": "30s"}, "gc": {"mode": "off"}}"#,
        )
        .unwrap();
        assert_eq!(config.runtime.concurrency, 8);
        assert_eq!(config.runtime.timeout, Duration::from_secs(30));
        assert_eq!(config.runtime.max_retries, 2);
        assert_eq!(config.gc.mode, GcMode::Off);
        assert_eq!(config.gc.retention_days, 1);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = Config::from_json_str("{").unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Serialization);
    }
}
