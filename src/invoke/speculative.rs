//! Speculative retry of slow calls.
//!
//! Per function, the threshold is
//! `max(mean latency + k * stdev(execution time), floor)`. A call that has
//! been outstanding for longer than threshold + slack since its first attempt
//! gets another concurrent attempt, while the retry budget lasts. After a
//! speculative attempt the next threshold is measured from that attempt;
//! failure retries do not move it. Attempts share one pending request, so
//! the first response wins.

use std::time::Duration;
use tokio::time::Instant;

use super::stats::FunctionStats;
use crate::types::RuntimeOptions;

/// Threshold parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeculativePolicy {
    /// Standard deviations of execution time above the mean latency.
    pub stdevs: f64,
    pub floor: Duration,
    pub slack: Duration,
}

impl Default for SpeculativePolicy {
    fn default() -> Self {
        Self::from_options(&RuntimeOptions::default())
    }
}

impl SpeculativePolicy {
    pub fn from_options(options: &RuntimeOptions) -> Self {
        Self {
            stdevs: options.speculative_retry_stdevs,
            floor: options.speculative_retry_floor,
            slack: options.speculative_retry_slack,
        }
    }

    /// Retry threshold for a function with the given statistics.
    pub fn threshold(&self, stats: Option<&FunctionStats>) -> Duration {
        let estimate_ms = stats
            .map(|stats| {
                stats.estimated_latency_ms() + self.stdevs * stats.execution_time.stdev()
            })
            .unwrap_or(0.0);
        if !estimate_ms.is_finite() || estimate_ms <= 0.0 {
            return self.floor;
        }
        Duration::from_secs_f64(estimate_ms / 1000.0).max(self.floor)
    }
}

/// Tracks when the next speculative attempt of one call is due.
#[derive(Debug, Clone)]
pub struct SpeculativeTimer {
    policy: SpeculativePolicy,
    anchor: Instant,
}

impl SpeculativeTimer {
    /// Start timing from the call's first attempt.
    pub fn new(policy: SpeculativePolicy, first_attempt: Instant) -> Self {
        Self {
            policy,
            anchor: first_attempt,
        }
    }

    /// When the next attempt is due given current statistics.
    pub fn deadline(&self, stats: Option<&FunctionStats>) -> Instant {
        self.anchor + self.policy.threshold(stats) + self.policy.slack
    }

    /// Whether elapsed time has reached the threshold plus the slack.
    pub fn is_due(&self, now: Instant, stats: Option<&FunctionStats>) -> bool {
        now >= self.deadline(stats)
    }

    /// Measure the next threshold from a new speculative attempt.
    pub fn rearm(&mut self, now: Instant) {
        self.anchor = now;
    }
}
