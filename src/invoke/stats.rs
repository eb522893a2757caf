//! Latency statistics, clock skew estimation and usage tracking.
//!
//! All durations are recorded in milliseconds as `f64`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::provider::MetricsSample;

/// Billing granularity used for the estimated billed time.
pub const BILLING_GRANULARITY_MS: f64 = 100.0;

// =============================================================================
// Running statistics
// =============================================================================

/// Running mean/variance/min/max (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    samples: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Statistics {
    pub fn update(&mut self, value: f64) {
        if self.samples == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Combine two independent sample sets.
    pub fn merge(&mut self, other: &Statistics) {
        if other.samples == 0 {
            return;
        }
        if self.samples == 0 {
            *self = *other;
            return;
        }
        let n_a = self.samples as f64;
        let n_b = other.samples as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;
        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.samples += other.samples;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.m2 / self.samples as f64
        }
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

// =============================================================================
// Per-call latency decomposition
// =============================================================================

/// Timestamps observed for one resolved call.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeline {
    /// `invoke` entered.
    pub created: DateTime<Utc>,
    /// First attempt handed to the backend.
    pub sent: DateTime<Utc>,
    /// Attempt whose response resolved the call. Equals `sent` when the
    /// first attempt won.
    pub attempt_sent: DateTime<Utc>,
    /// Response observed locally.
    pub received: DateTime<Utc>,
    pub remote_start: Option<DateTime<Utc>>,
    pub remote_end: Option<DateTime<Utc>>,
}

impl CallTimeline {
    /// Skew sample (remote clock minus local clock), assuming symmetric
    /// one-way latencies of the winning attempt.
    pub fn skew_sample_ms(&self) -> Option<f64> {
        let (start, end) = (self.remote_start?, self.remote_end?);
        let outbound = millis_between(self.attempt_sent, start);
        let inbound = millis_between(self.received, end);
        Some((outbound + inbound) / 2.0)
    }
}

/// Send time of the attempt that most likely produced a response which
/// started remotely at `remote_start`: the latest send no later than the
/// skew-corrected start. Falls back to the first send.
pub fn winning_attempt(
    sends: &[DateTime<Utc>],
    remote_start: Option<DateTime<Utc>>,
    skew_ms: f64,
) -> Option<DateTime<Utc>> {
    let first = *sends.first()?;
    let Some(start) = remote_start else {
        return Some(first);
    };
    let started_ms = millis_between(first, start) - skew_ms;
    let winner = sends
        .iter()
        .rev()
        .find(|sent| millis_between(first, **sent) <= started_ms)
        .copied();
    Some(winner.unwrap_or(first))
}

/// Latency decomposition of one call. Every component is non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallLatencies {
    pub local_start_ms: f64,
    pub remote_start_ms: f64,
    pub execution_ms: f64,
    pub return_ms: f64,
}

impl CallLatencies {
    /// Decompose a timeline given the current skew estimate.
    ///
    /// Local start runs to the first attempt; the remote side is measured
    /// from the winning attempt. Without remote timestamps everything after
    /// that send is attributed to execution.
    pub fn from_timeline(timeline: &CallTimeline, skew_ms: f64) -> Self {
        let local_start_ms = millis_between(timeline.created, timeline.sent);
        let sent = timeline.attempt_sent;
        match (timeline.remote_start, timeline.remote_end) {
            (Some(start), Some(end)) => {
                let start_local = millis_between(sent, start) - skew_ms;
                let end_local = millis_between(sent, end) - skew_ms;
                let total = millis_between(sent, timeline.received);
                Self {
                    local_start_ms: local_start_ms.max(0.0),
                    remote_start_ms: start_local.max(0.0),
                    execution_ms: millis_between(start, end).max(0.0),
                    return_ms: (total - end_local).max(0.0),
                }
            }
            _ => Self {
                local_start_ms: local_start_ms.max(0.0),
                execution_ms: millis_between(sent, timeline.received).max(0.0),
                ..Self::default()
            },
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.local_start_ms + self.remote_start_ms + self.execution_ms + self.return_ms
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0
}

/// Exponentially decayed clock skew estimate (weight 0.3 per update).
#[derive(Debug, Default)]
pub struct SkewEstimator {
    value: Mutex<Option<f64>>,
}

impl SkewEstimator {
    pub const WEIGHT: f64 = 0.3;

    pub fn update(&self, sample_ms: f64) -> f64 {
        let mut value = self.value.lock();
        let next = match *value {
            None => sample_ms,
            Some(current) => current * (1.0 - Self::WEIGHT) + sample_ms * Self::WEIGHT,
        };
        *value = Some(next);
        next
    }

    pub fn get(&self) -> f64 {
        self.value.lock().unwrap_or(0.0)
    }
}

// =============================================================================
// Per-function statistics
// =============================================================================

/// Counters and latency statistics for one function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub invocations: u64,
    pub completed: u64,
    pub errors: u64,
    pub retries: u64,
    pub speculative_retries: u64,
    pub local_start_latency: Statistics,
    pub remote_start_latency: Statistics,
    pub execution_time: Statistics,
    pub return_latency: Statistics,
    pub estimated_billed_time: Statistics,
}

impl FunctionStats {
    pub fn record(&mut self, latencies: &CallLatencies) {
        self.completed += 1;
        self.local_start_latency.update(latencies.local_start_ms);
        self.remote_start_latency.update(latencies.remote_start_ms);
        self.execution_time.update(latencies.execution_ms);
        self.return_latency.update(latencies.return_ms);
        let billed =
            (latencies.execution_ms / BILLING_GRANULARITY_MS).ceil() * BILLING_GRANULARITY_MS;
        self.estimated_billed_time.update(billed);
    }

    /// Mean end-to-end latency in milliseconds.
    pub fn estimated_latency_ms(&self) -> f64 {
        self.local_start_latency.mean()
            + self.remote_start_latency.mean()
            + self.execution_time.mean()
            + self.return_latency.mean()
    }

    pub fn combine(&mut self, other: &FunctionStats) {
        self.invocations += other.invocations;
        self.completed += other.completed;
        self.errors += other.errors;
        self.retries += other.retries;
        self.speculative_retries += other.speculative_retries;
        self.local_start_latency.merge(&other.local_start_latency);
        self.remote_start_latency.merge(&other.remote_start_latency);
        self.execution_time.merge(&other.execution_time);
        self.return_latency.merge(&other.return_latency);
        self.estimated_billed_time.merge(&other.estimated_billed_time);
    }
}

/// Snapshot published on the statistics stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEvent {
    pub function_name: String,
    /// Activity since the previous snapshot.
    pub incremental: FunctionStats,
    pub aggregate: FunctionStats,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StatsTables {
    aggregate: HashMap<String, FunctionStats>,
    incremental: HashMap<String, FunctionStats>,
}

/// Aggregate and incremental statistics keyed by function name.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    tables: Mutex<StatsTables>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_both(&self, function_name: &str, apply: impl Fn(&mut FunctionStats)) {
        let mut tables = self.tables.lock();
        apply(tables.aggregate.entry(function_name.to_string()).or_default());
        apply(tables.incremental.entry(function_name.to_string()).or_default());
    }

    pub fn record_invocation(&self, function_name: &str) {
        self.with_both(function_name, |stats| stats.invocations += 1);
    }

    pub fn record_retry(&self, function_name: &str, speculative: bool) {
        self.with_both(function_name, |stats| {
            if speculative {
                stats.speculative_retries += 1;
            } else {
                stats.retries += 1;
            }
        });
    }

    pub fn record_success(&self, function_name: &str, latencies: &CallLatencies) {
        self.with_both(function_name, |stats| stats.record(latencies));
    }

    pub fn record_error(&self, function_name: &str) {
        self.with_both(function_name, |stats| stats.errors += 1);
    }

    pub fn aggregate(&self, function_name: &str) -> Option<FunctionStats> {
        self.tables.lock().aggregate.get(function_name).cloned()
    }

    pub fn all(&self) -> HashMap<String, FunctionStats> {
        self.tables.lock().aggregate.clone()
    }

    /// Totals across every function.
    pub fn total(&self) -> FunctionStats {
        let tables = self.tables.lock();
        let mut total = FunctionStats::default();
        for stats in tables.aggregate.values() {
            total.combine(stats);
        }
        total
    }

    /// Take the incremental window and pair it with the aggregates.
    pub fn snapshot(&self, at: DateTime<Utc>) -> Vec<StatsEvent> {
        let mut tables = self.tables.lock();
        let incremental = std::mem::take(&mut tables.incremental);
        let mut events: Vec<StatsEvent> = incremental
            .into_iter()
            .map(|(function_name, incremental)| {
                let aggregate = tables
                    .aggregate
                    .get(&function_name)
                    .cloned()
                    .unwrap_or_default();
                StatsEvent {
                    function_name,
                    incremental,
                    aggregate,
                    at,
                }
            })
            .collect();
        events.sort_by(|a, b| a.function_name.cmp(&b.function_name));
        events
    }
}

// =============================================================================
// Resource usage
// =============================================================================

/// Usage merged into one elapsed-second bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub samples: u64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    /// Peak resident memory in bytes.
    pub memory_rss: u64,
}

/// Per-second CPU and memory usage reported by queued workers.
#[derive(Debug, Default)]
pub struct UsageTracker {
    buckets: Mutex<HashMap<String, BTreeMap<u64, UsageBucket>>>,
}

impl UsageTracker {
    pub fn record(&self, sample: &MetricsSample) {
        let second = sample.elapsed_secs.max(0.0).floor() as u64;
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(sample.function_name.clone())
            .or_default()
            .entry(second)
            .or_default();
        bucket.samples += 1;
        bucket.cpu_user += sample.cpu_user;
        bucket.cpu_system += sample.cpu_system;
        bucket.memory_rss = bucket.memory_rss.max(sample.memory_rss);
    }

    pub fn usage(&self, function_name: &str) -> BTreeMap<u64, UsageBucket> {
        self.buckets
            .lock()
            .get(function_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_statistics_mean_and_stdev() {
        let mut stats = Statistics::default();
        for value in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.update(value);
        }
        assert_eq!(stats.samples(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        assert!((stats.stdev() - 2.0).abs() < 1e-9);
        assert_eq!(stats.min(), 2.0);
        assert_eq!(stats.max(), 9.0);
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let values = [1.0, 3.0, 8.0, 2.5, 7.0, 11.0];
        let mut whole = Statistics::default();
        values.iter().for_each(|v| whole.update(*v));

        let mut left = Statistics::default();
        let mut right = Statistics::default();
        values[..2].iter().for_each(|v| left.update(*v));
        values[2..].iter().for_each(|v| right.update(*v));
        left.merge(&right);

        assert_eq!(left.samples(), whole.samples());
        assert!((left.mean() - whole.mean()).abs() < 1e-9);
        assert!((left.variance() - whole.variance()).abs() < 1e-9);
    }

    #[test]
    fn test_skew_estimator_decays() {
        let skew = SkewEstimator::default();
        assert_eq!(skew.get(), 0.0);
        assert_eq!(skew.update(100.0), 100.0);
        assert!((skew.update(0.0) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_latencies_with_skewed_remote_clock() {
        let created = Utc::now();
        let sent = created + Duration::milliseconds(5);
        // Remote clock runs 1000ms ahead; 20ms each way; 100ms execution.
        let remote_start = sent + Duration::milliseconds(1020);
        let remote_end = remote_start + Duration::milliseconds(100);
        let received = sent + Duration::milliseconds(140);
        let timeline = CallTimeline {
            created,
            sent,
            attempt_sent: sent,
            received,
            remote_start: Some(remote_start),
            remote_end: Some(remote_end),
        };
        let skew = timeline.skew_sample_ms().unwrap();
        assert!((skew - 1000.0).abs() < 1e-6);

        let latencies = CallLatencies::from_timeline(&timeline, skew);
        assert!((latencies.local_start_ms - 5.0).abs() < 1e-6);
        assert!((latencies.remote_start_ms - 20.0).abs() < 1e-6);
        assert!((latencies.execution_ms - 100.0).abs() < 1e-6);
        assert!((latencies.return_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_retried_call_measured_from_winning_attempt() {
        let created = Utc::now();
        let sent = created + Duration::milliseconds(2);
        // First attempt hung; the retry 6s later answered in 40ms on a synced clock.
        let retry = sent + Duration::seconds(6);
        let remote_start = retry + Duration::milliseconds(10);
        let remote_end = remote_start + Duration::milliseconds(20);
        let received = remote_end + Duration::milliseconds(10);
        let timeline = CallTimeline {
            created,
            sent,
            attempt_sent: retry,
            received,
            remote_start: Some(remote_start),
            remote_end: Some(remote_end),
        };
        let skew = timeline.skew_sample_ms().unwrap();
        assert!(skew.abs() < 1e-6, "skew {skew}");

        let latencies = CallLatencies::from_timeline(&timeline, skew);
        assert!((latencies.local_start_ms - 2.0).abs() < 1e-6);
        assert!((latencies.remote_start_ms - 10.0).abs() < 1e-6);
        assert!((latencies.execution_ms - 20.0).abs() < 1e-6);
        assert!((latencies.return_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_winning_attempt_matches_remote_start() {
        let first = Utc::now();
        let sends = [
            first,
            first + Duration::seconds(5),
            first + Duration::seconds(11),
        ];
        let started = |offset_ms: i64| Some(first + Duration::milliseconds(offset_ms));

        assert_eq!(winning_attempt(&sends, started(30), 0.0), Some(sends[0]));
        assert_eq!(winning_attempt(&sends, started(5_030), 0.0), Some(sends[1]));
        assert_eq!(winning_attempt(&sends, started(12_000), 0.0), Some(sends[2]));
        // Remote clock 2s ahead: a start stamped at 7s happened locally at 5s.
        assert_eq!(winning_attempt(&sends, started(7_030), 2_000.0), Some(sends[1]));
        assert_eq!(winning_attempt(&sends, started(-500), 0.0), Some(sends[0]));
        assert_eq!(winning_attempt(&sends, None, 0.0), Some(sends[0]));
        assert_eq!(winning_attempt(&[], started(0), 0.0), None);
    }

    #[test]
    fn test_latencies_never_negative() {
        let now = Utc::now();
        let timeline = CallTimeline {
            created: now,
            sent: now,
            attempt_sent: now,
            received: now + Duration::milliseconds(10),
            remote_start: Some(now - Duration::seconds(30)),
            remote_end: Some(now - Duration::seconds(29)),
        };
        let latencies = CallLatencies::from_timeline(&timeline, 0.0);
        assert!(latencies.local_start_ms >= 0.0);
        assert!(latencies.remote_start_ms >= 0.0);
        assert!(latencies.execution_ms >= 0.0);
        assert!(latencies.return_ms >= 0.0);
    }

    #[test]
    fn test_registry_snapshot_resets_incremental() {
        let registry = StatsRegistry::new();
        registry.record_invocation("add");
        registry.record_success(
            "add",
            &CallLatencies {
                execution_ms: 120.0,
                ..Default::default()
            },
        );
        let events = registry.snapshot(Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].incremental.completed, 1);
        assert_eq!(events[0].aggregate.estimated_billed_time.mean(), 200.0);

        registry.record_error("add");
        let events = registry.snapshot(Utc::now());
        assert_eq!(events[0].incremental.completed, 0);
        assert_eq!(events[0].incremental.errors, 1);
        assert_eq!(events[0].aggregate.completed, 1);
        assert!(registry.snapshot(Utc::now()).is_empty());
    }

    #[test]
    fn test_usage_buckets_by_second() {
        let usage = UsageTracker::default();
        for (elapsed, rss) in [(0.2, 10), (0.8, 30), (1.5, 20)] {
            usage.record(&MetricsSample {
                call_id: crate::types::CallId::new(),
                function_name: "work".to_string(),
                elapsed_secs: elapsed,
                cpu_user: 0.1,
                cpu_system: 0.05,
                memory_rss: rss,
            });
        }
        let buckets = usage.usage("work");
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&0].samples, 2);
        assert_eq!(buckets[&0].memory_rss, 30);
        assert_eq!(buckets[&1].memory_rss, 20);
    }
}
