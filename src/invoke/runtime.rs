//! Invocation runtime.
//!
//! [`Runtime`] turns a function call into one or more physical attempts on a
//! [`Backend`] and delivers exactly one result to the caller:
//!
//! 1. register a pending request under a fresh call id
//! 2. wait for a slot in the runtime-wide funnel
//! 3. launch the first attempt, then drive retries: retryable failures,
//!    speculative re-issue of slow calls, re-enqueue of queued calls that
//!    never started
//! 4. on resolution, decompose latency and update statistics

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::call::{Call, Return};
use super::collector::ResultCollector;
use super::pending::{CorrelationTable, FailureReceiver, ResultReceiver};
use super::speculative::{SpeculativePolicy, SpeculativeTimer};
use super::stats::{
    winning_attempt, CallLatencies, CallTimeline, FunctionStats, SkewEstimator, StatsEvent,
    StatsRegistry,
    UsageBucket, UsageTracker,
};
use crate::gc::{GcCoordinator, ResourceInventory};
use crate::provider::{Backend, CleanupOptions, CostBreakdown, Mode, Provider};
use crate::throttle::Funnel;
use crate::types::{CallId, Error, ErrorContext, ErrorKind, InstanceId, Result, RuntimeOptions};

const STATS_CHANNEL_CAPACITY: usize = 256;

/// Remote invocation runtime over one backend. Cloning shares the runtime.
pub struct Runtime<B: Backend> {
    inner: Arc<RuntimeInner<B>>,
}

struct RuntimeInner<B: Backend> {
    instance_id: InstanceId,
    backend: Arc<B>,
    options: RuntimeOptions,
    table: Arc<CorrelationTable>,
    funnel: Funnel,
    stats: Arc<StatsRegistry>,
    skew: SkewEstimator,
    usage: Arc<UsageTracker>,
    speculative: SpeculativePolicy,
    cancel: CancellationToken,
    tasks: TaskTracker,
    collector: Mutex<Option<ResultCollector>>,
    stats_tx: broadcast::Sender<StatsEvent>,
}

/// A call resolved by the driver, with the send times of its first and
/// winning attempts.
struct Delivered {
    ret: Return,
    sent: DateTime<Utc>,
    attempt_sent: DateTime<Utc>,
}

/// Removes the pending entry if the caller goes away before resolution.
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    call_id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.call_id);
    }
}

impl<B: Backend> Runtime<B> {
    /// Wrap an initialized backend. Must be called within a tokio runtime.
    pub fn new(instance_id: InstanceId, backend: B, options: RuntimeOptions) -> Self {
        let backend = Arc::new(backend);
        let table = Arc::new(CorrelationTable::new());
        let stats = Arc::new(StatsRegistry::new());
        let usage = Arc::new(UsageTracker::default());
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (stats_tx, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

        let collector = (backend.mode() == Mode::Queued).then(|| {
            ResultCollector::start(
                backend.clone(),
                table.clone(),
                usage.clone(),
                &options,
                &cancel,
            )
        });

        spawn_stats_ticker(
            &tasks,
            stats.clone(),
            stats_tx.clone(),
            options.stats_interval,
            cancel.clone(),
        );

        tracing::info!(
            "runtime_started: instance_id={}, backend={}, mode={:?}, concurrency={}",
            instance_id,
            backend.name(),
            backend.mode(),
            options.concurrency
        );

        Self {
            inner: Arc::new(RuntimeInner {
                instance_id,
                backend,
                funnel: Funnel::new(options.concurrency),
                speculative: SpeculativePolicy::from_options(&options),
                options,
                table,
                stats,
                skew: SkewEstimator::default(),
                usage,
                cancel,
                tasks,
                collector: Mutex::new(collector),
                stats_tx,
            }),
        }
    }

    /// Create backend resources through `provider` and start a runtime.
    pub async fn initialize<P>(provider: &P, module: P::Module, options: RuntimeOptions) -> Result<Self>
    where
        P: Provider<Backend = B>,
    {
        let instance_id = InstanceId::new();
        let backend = provider.initialize(module, &instance_id, &options).await?;
        Ok(Self::new(instance_id, backend, options))
    }

    /// Like [`Runtime::initialize`], then start a background sweep of
    /// `inventory`. The sweep never affects the returned runtime.
    pub async fn initialize_with_gc<P>(
        provider: &P,
        module: P::Module,
        options: RuntimeOptions,
        coordinator: Arc<GcCoordinator>,
        inventory: Arc<dyn ResourceInventory>,
    ) -> Result<Self>
    where
        P: Provider<Backend = B>,
    {
        let runtime = Self::initialize(provider, module, options).await?;
        runtime.spawn_gc(coordinator, inventory);
        Ok(runtime)
    }

    /// Invoke `function_name` with pre-serialized arguments.
    pub async fn invoke(&self, function_name: &str, args: Bytes) -> Result<Bytes> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::cancelled("runtime has been cleaned up").with_function(function_name));
        }

        let digest = args_digest(&args);
        let call = Arc::new(
            Call::new(function_name, args).with_response_channel(inner.backend.response_channel_id()),
        );
        let created = Utc::now();
        let (rx, failures) = inner.table.insert(call.clone())?;
        let _guard = PendingGuard {
            table: &inner.table,
            call_id: call.call_id.clone(),
        };
        inner.stats.record_invocation(function_name);
        tracing::debug!(
            "invoke_started: call_id={}, function={}",
            call.call_id,
            function_name
        );

        let driver = inner.clone();
        let driven = inner
            .funnel
            .push(move || driver.drive(call, rx, failures))
            .await;

        let context = ErrorContext {
            function_name: Some(function_name.to_string()),
            args_digest: Some(digest),
            ..Default::default()
        };
        let delivered = match driven {
            Ok(delivered) => delivered,
            Err(err) => {
                inner.stats.record_error(function_name);
                return Err(err.with_context(context));
            }
        };

        let received = Utc::now();
        let timeline = CallTimeline {
            created,
            sent: delivered.sent,
            attempt_sent: delivered.attempt_sent,
            received,
            remote_start: delivered.ret.remote_start,
            remote_end: delivered.ret.remote_end,
        };
        match delivered.ret.into_result() {
            Ok(value) => {
                if let Some(sample) = timeline.skew_sample_ms() {
                    inner.skew.update(sample);
                }
                let latencies = CallLatencies::from_timeline(&timeline, inner.skew.get());
                inner.stats.record_success(function_name, &latencies);
                Ok(value)
            }
            Err(err) => {
                inner.stats.record_error(function_name);
                Err(err.with_context(context))
            }
        }
    }

    /// Invoke with JSON-serialized arguments and result.
    ///
    /// Arguments that fail to serialize are reported immediately and never
    /// reach the backend.
    pub async fn invoke_typed<A, R>(&self, function_name: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let encoded = serde_json::to_vec(args).map_err(|err| {
            Error::serialization(format!("cannot serialize arguments: {err}"))
                .with_cause(err)
                .with_function(function_name)
        })?;
        let value = self.invoke(function_name, Bytes::from(encoded)).await?;
        serde_json::from_slice(&value).map_err(|err| {
            Error::serialization(format!("cannot deserialize return value: {err}"))
                .with_cause(err)
                .with_function(function_name)
        })
    }

    /// Handle bound to one function name.
    pub fn function(&self, function_name: impl Into<String>) -> FunctionHandle<B> {
        FunctionHandle {
            runtime: self.clone(),
            function_name: function_name.into(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Calls registered and not yet resolved.
    pub fn pending_len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn stats(&self, function_name: &str) -> Option<FunctionStats> {
        self.inner.stats.aggregate(function_name)
    }

    pub fn all_stats(&self) -> HashMap<String, FunctionStats> {
        self.inner.stats.all()
    }

    /// Periodic incremental statistics, one event per active function.
    pub fn subscribe_stats(&self) -> broadcast::Receiver<StatsEvent> {
        self.inner.stats_tx.subscribe()
    }

    /// Per-second worker usage reported for `function_name`.
    pub fn usage(&self, function_name: &str) -> BTreeMap<u64, UsageBucket> {
        self.inner.usage.usage(function_name)
    }

    /// Current clock skew estimate in milliseconds (remote minus local).
    pub fn clock_skew_ms(&self) -> f64 {
        self.inner.skew.get()
    }

    pub fn cost_snapshot(&self) -> CostBreakdown {
        self.inner.backend.cost_snapshot(&self.inner.stats.total())
    }

    /// Run a best-effort garbage collection sweep in the background,
    /// excluding this instance's own resources. Errors are logged only.
    pub fn spawn_gc(&self, coordinator: Arc<GcCoordinator>, inventory: Arc<dyn ResourceInventory>) {
        let exclude = self.inner.instance_id.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => tracing::debug!("gc_abandoned: reason=runtime_cleanup"),
                report = coordinator.maybe_sweep(inventory.as_ref(), Some(&exclude)) => {
                    if let Some(report) = report {
                        tracing::info!(
                            "gc_finished: deleted={}, already_gone={}, failed={}",
                            report.deleted,
                            report.already_gone,
                            report.failed
                        );
                    }
                }
            }
        });
    }

    /// Tear down: reject every outstanding call with a cancellation error,
    /// stop background work, then let the backend remove its resources.
    pub async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        let inner = &self.inner;
        inner.cancel.cancel();
        let rejected = inner
            .table
            .reject_all(&Error::cancelled("runtime cleanup"));
        inner.funnel.clear();

        let collector = inner.collector.lock().take();
        if let Some(collector) = collector {
            collector.drain().await;
        }
        inner.tasks.close();
        inner.tasks.wait().await;

        tracing::info!(
            "runtime_cleanup: instance_id={}, rejected={}",
            inner.instance_id,
            rejected
        );
        inner.backend.cleanup(options).await
    }
}

impl<B: Backend> RuntimeInner<B> {
    /// Drive one call to resolution. Runs inside a funnel slot.
    async fn drive(
        self: Arc<Self>,
        call: Arc<Call>,
        mut rx: ResultReceiver,
        mut failures: FailureReceiver,
    ) -> Result<Delivered> {
        let function_name = call.function_name.as_str();
        let queued = self.backend.mode() == Mode::Queued;
        let max_retries = self.options.max_retries;
        let attempt_budget = self.options.timeout + self.options.response_grace;

        let started = Instant::now();
        let mut sends = vec![self.launch_attempt(&call)];

        let mut timer = SpeculativeTimer::new(self.speculative, started);
        let mut retries = 0u32;
        let mut enqueue_retries = 0u32;
        let mut last_attempt = started;
        let mut acknowledged = false;

        loop {
            let stats = self.stats.aggregate(function_name);
            let speculative_at = timer.deadline(stats.as_ref());
            let start_check_at = last_attempt + self.options.queued_start_timeout;
            let attempt_deadline = last_attempt + attempt_budget;
            let check_start = queued && !acknowledged && enqueue_retries < max_retries;

            let failure = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.table.reject(&call.call_id, Error::cancelled("runtime cleanup"));
                    return Err(Error::cancelled("runtime cleanup"));
                }
                resolved = &mut rx => {
                    return match resolved {
                        Ok(Ok(ret)) => {
                            let sent = sends[0];
                            let attempt_sent = ret
                                .attempt_sent
                                .or_else(|| {
                                    winning_attempt(&sends, ret.remote_start, self.skew.get())
                                })
                                .unwrap_or(sent);
                            Ok(Delivered {
                                ret,
                                sent,
                                attempt_sent,
                            })
                        }
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(Error::cancelled("pending request dropped")),
                    };
                }
                Some(err) = failures.recv() => err,
                _ = sleep_until(attempt_deadline) => {
                    Error::timeout(format!(
                        "no response within {:?}",
                        attempt_budget
                    ))
                }
                _ = sleep_until(speculative_at), if retries < max_retries => {
                    let now = Instant::now();
                    if timer.is_due(now, self.stats.aggregate(function_name).as_ref()) {
                        retries += 1;
                        self.stats.record_retry(function_name, true);
                        tracing::info!(
                            "speculative_retry: call_id={}, function={}, attempt={}, elapsed={:?}",
                            call.call_id,
                            function_name,
                            retries + 1,
                            now.duration_since(started)
                        );
                        sends.push(self.launch_attempt(&call));
                        timer.rearm(now);
                        last_attempt = now;
                    }
                    continue;
                }
                _ = sleep_until(start_check_at), if check_start => {
                    if self.table.is_executing(&call.call_id) {
                        acknowledged = true;
                    } else if self.table.len() < self.options.queued_retry_backlog_threshold {
                        enqueue_retries += 1;
                        self.stats.record_retry(function_name, false);
                        tracing::info!(
                            "enqueue_retry: call_id={}, function={}, attempt={}",
                            call.call_id,
                            function_name,
                            enqueue_retries + 1
                        );
                        sends.push(self.launch_attempt(&call));
                        last_attempt = Instant::now();
                    } else {
                        // Backlog too large to amplify; keep waiting.
                        acknowledged = true;
                    }
                    continue;
                }
            };

            if failure.is_retryable() && retries < max_retries {
                retries += 1;
                self.stats.record_retry(function_name, false);
                tracing::warn!(
                    "attempt_failed: call_id={}, function={}, attempt={}, error={}",
                    call.call_id,
                    function_name,
                    retries,
                    failure
                );
                sends.push(self.launch_attempt(&call));
                last_attempt = Instant::now();
                acknowledged = false;
            } else {
                self.table.reject(&call.call_id, failure.clone());
                return Err(failure);
            }
        }
    }

    /// Send one physical attempt in the background and return its send
    /// time. Its outcome is routed through the correlation table like any
    /// queued response.
    fn launch_attempt(self: &Arc<Self>, call: &Arc<Call>) -> DateTime<Utc> {
        let inner = self.clone();
        let call = call.clone();
        let sent = Utc::now();
        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = inner.cancel.cancelled() => Ok(None),
                outcome = inner.backend.invoke(&call, &inner.cancel) => outcome,
            };
            if !inner.table.contains(&call.call_id) {
                tracing::debug!("late_attempt_ignored: call_id={}", call.call_id);
                return;
            }
            match outcome {
                Ok(Some(ret)) => {
                    inner.table.complete(Return {
                        attempt_sent: Some(sent),
                        ..ret
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    inner.table.report_failure(&call.call_id, err);
                }
            }
        });
        sent
    }
}

impl<B: Backend> Drop for RuntimeInner<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<B: Backend> Clone for Runtime<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("instance_id", &self.inner.instance_id)
            .field("backend", &self.inner.backend.name())
            .field("pending", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}

/// A runtime bound to one function name.
pub struct FunctionHandle<B: Backend> {
    runtime: Runtime<B>,
    function_name: String,
}

impl<B: Backend> FunctionHandle<B> {
    pub fn name(&self) -> &str {
        &self.function_name
    }

    pub async fn call<A, R>(&self, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.runtime.invoke_typed(&self.function_name, args).await
    }

    pub async fn invoke(&self, args: Bytes) -> Result<Bytes> {
        self.runtime.invoke(&self.function_name, args).await
    }

    pub fn stats(&self) -> Option<FunctionStats> {
        self.runtime.stats(&self.function_name)
    }
}

impl<B: Backend> fmt::Debug for FunctionHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("function_name", &self.function_name)
            .finish_non_exhaustive()
    }
}

/// Short SHA-256 digest of serialized arguments, for error context.
pub fn args_digest(args: &[u8]) -> String {
    let mut digest = format!("{:x}", Sha256::digest(args));
    digest.truncate(16);
    digest
}

fn spawn_stats_ticker(
    tasks: &TaskTracker,
    stats: Arc<StatsRegistry>,
    tx: broadcast::Sender<StatsEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(Duration::from_millis(10));
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for event in stats.snapshot(Utc::now()) {
                        // No subscribers is fine.
                        let _ = tx.send(event);
                    }
                }
            }
        }
    });
}
