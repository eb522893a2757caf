//! In-process backend.
//!
//! Runs registered async handlers on the local tokio runtime. In direct mode
//! `invoke` returns the result; in queued mode the handler runs in the
//! background and its `functionstarted`, metrics and `response` messages go
//! through an in-memory response queue drained by `poll`, exactly as a
//! remote queue would deliver them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};

use super::{
    resource_name, Backend, CleanupOptions, CostBreakdown, Message, MetricsSample, Mode,
    PollResult, Pricing, Provider, WireMessage,
};
use crate::invoke::{Call, FunctionStats, RemoteError, Return};
use crate::types::{Error, ErrorKind, InstanceId, Result, RuntimeOptions};

type Handler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, std::result::Result<Bytes, RemoteError>> + Send + Sync>;

/// Named async handlers a local backend can run.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler over raw argument bytes.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, RemoteError>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |args: Bytes| handler(args).boxed()));
        self
    }

    /// Register a handler taking and returning JSON values.
    pub fn register_json<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move |args: Bytes| {
            let handler = handler.clone();
            async move {
                let args: A = serde_json::from_slice(&args).map_err(|err| {
                    RemoteError::new(ErrorKind::Serialization, format!("bad arguments: {err}"))
                })?;
                let value = handler(args).await?;
                serde_json::to_vec(&value).map(Bytes::from).map_err(|err| {
                    RemoteError::new(ErrorKind::Serialization, format!("bad return value: {err}"))
                })
            }
        })
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

// =============================================================================
// Response queue
// =============================================================================

#[derive(Debug, Default)]
struct ResponseQueue {
    messages: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
}

impl ResponseQueue {
    fn publish(&self, message: Message) {
        match message.to_wire() {
            Ok(wire) => {
                self.messages.lock().push_back(wire);
                self.notify.notify_waiters();
            }
            Err(err) => tracing::error!("local_publish_failed: kind={}, error={}", message.kind(), err),
        }
    }

    fn take(&self, max: usize) -> Vec<WireMessage> {
        let mut messages = self.messages.lock();
        let n = messages.len().min(max);
        messages.drain(..n).collect()
    }

    fn clear(&self) {
        self.messages.lock().clear();
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Local worker pool backend.
pub struct LocalBackend {
    instance_id: InstanceId,
    registry: FunctionRegistry,
    mode: Mode,
    timeout: Duration,
    memory_size_mb: u32,
    batch_size: usize,
    poll_wait: Duration,
    pricing: Pricing,
    queue: Arc<ResponseQueue>,
    workers: TaskTracker,
    shutdown: CancellationToken,
}

impl LocalBackend {
    pub fn new(
        registry: FunctionRegistry,
        mode: Mode,
        instance_id: InstanceId,
        options: &RuntimeOptions,
    ) -> Self {
        Self {
            instance_id,
            registry,
            mode,
            timeout: options.timeout,
            memory_size_mb: options.memory_size_mb,
            batch_size: options.collector_batch_size.max(1),
            poll_wait: Duration::from_secs(20),
            pricing: Pricing::FREE,
            queue: Arc::new(ResponseQueue::default()),
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Direct-mode backend with default options.
    pub fn direct(registry: FunctionRegistry) -> Self {
        Self::new(registry, Mode::Direct, InstanceId::new(), &RuntimeOptions::default())
    }

    /// Queued-mode backend with default options.
    pub fn queued(registry: FunctionRegistry) -> Self {
        Self::new(registry, Mode::Queued, InstanceId::new(), &RuntimeOptions::default())
    }

    /// Longest time a poll waits for messages.
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Number of background executions still running (queued mode).
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    fn worker_id(&self) -> String {
        format!("{}-local", resource_name(&self.instance_id))
    }

    fn enqueue(&self, call: &Call) {
        let Some(handler) = self.registry.get(&call.function_name) else {
            self.queue.publish(Message::DeadLetter {
                call_id: call.call_id.clone(),
                reason: format!("function {} is not registered", call.function_name),
            });
            return;
        };
        let queue = self.queue.clone();
        let call = call.clone();
        let timeout = self.timeout;
        let worker_id = self.worker_id();
        let shutdown = self.shutdown.clone();
        self.workers.spawn(async move {
            queue.publish(Message::FunctionStarted {
                call_id: call.call_id.clone(),
            });
            let started = Instant::now();
            let ret = tokio::select! {
                _ = shutdown.cancelled() => return,
                ret = execute(handler, &call, timeout, worker_id) => ret,
            };
            queue.publish(Message::Metrics(MetricsSample {
                call_id: call.call_id.clone(),
                function_name: call.function_name.clone(),
                elapsed_secs: started.elapsed().as_secs_f64(),
                cpu_user: 0.0,
                cpu_system: 0.0,
                memory_rss: 0,
            }));
            queue.publish(Message::Response(ret));
        });
    }
}

/// Run a handler under a timeout, isolating panics. Dropping the returned
/// future aborts the handler.
async fn execute(handler: Handler, call: &Call, timeout: Duration, worker_id: String) -> Return {
    let start = Utc::now();
    let run = AbortOnDropHandle::new(tokio::spawn(tokio::time::timeout(
        timeout,
        handler(call.args.clone()),
    )));
    let outcome = match run.await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(remote))) => Err(remote),
        Ok(Err(_)) => Err(RemoteError::new(
            ErrorKind::Timeout,
            format!("{} exceeded its {:?} timeout", call.function_name, timeout),
        )),
        Err(join) => Err(RemoteError::new(
            ErrorKind::User,
            format!("{} panicked: {}", call.function_name, join),
        )),
    };
    let end = Utc::now();
    let ret = match outcome {
        Ok(value) => Return::success(call.call_id.clone(), value),
        Err(remote) => Return::failure(call.call_id.clone(), remote),
    };
    Return {
        instance_id: Some(worker_id),
        ..ret.with_timing(start, end)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    async fn invoke(&self, call: &Call, cancel: &CancellationToken) -> Result<Option<Return>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled("local backend has been cleaned up"));
        }
        match self.mode {
            Mode::Queued => {
                self.enqueue(call);
                Ok(None)
            }
            Mode::Direct => {
                let handler = self.registry.get(&call.function_name).ok_or_else(|| {
                    Error::validation(format!("function {} is not registered", call.function_name))
                })?;
                tokio::select! {
                    _ = cancel.cancelled() => Ok(None),
                    ret = execute(handler, call, self.timeout, self.worker_id()) => Ok(Some(ret)),
                }
            }
        }
    }

    async fn poll(&self, cancel: &CancellationToken) -> Result<PollResult> {
        let deadline = Instant::now() + self.poll_wait;
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wire = self.queue.take(self.batch_size);
            if !wire.is_empty() {
                let is_full_batch = wire.len() == self.batch_size;
                let mut messages = Vec::with_capacity(wire.len());
                for message in &wire {
                    match Message::from_wire(message) {
                        Ok(message) => messages.push(message),
                        Err(err) => tracing::warn!("local_message_dropped: error={}", err),
                    }
                }
                return Ok(PollResult {
                    messages,
                    is_full_batch,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(PollResult::default()),
                _ = self.shutdown.cancelled() => return Ok(PollResult::default()),
                _ = tokio::time::sleep_until(deadline) => return Ok(PollResult::default()),
                _ = &mut notified => {}
            }
        }
    }

    fn response_channel_id(&self) -> Option<String> {
        (self.mode == Mode::Queued).then(|| format!("{}-responses", resource_name(&self.instance_id)))
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        self.queue.clear();
        tracing::debug!(
            "local_cleanup: instance_id={}, delete_resources={}",
            self.instance_id,
            options.delete_resources
        );
        Ok(())
    }

    fn cost_snapshot(&self, stats: &FunctionStats) -> CostBreakdown {
        self.pricing.breakdown(stats, self.memory_size_mb)
    }
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("instance_id", &self.instance_id)
            .field("mode", &self.mode)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Provider for [`LocalBackend`].
#[derive(Debug, Clone)]
pub struct LocalProvider {
    mode: Mode,
}

impl LocalProvider {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    type Module = FunctionRegistry;
    type Backend = LocalBackend;

    fn name(&self) -> &str {
        "local"
    }

    async fn initialize(
        &self,
        module: FunctionRegistry,
        instance_id: &InstanceId,
        options: &RuntimeOptions,
    ) -> Result<LocalBackend> {
        if module.handlers.is_empty() {
            return Err(Error::validation("no functions registered"));
        }
        Ok(LocalBackend::new(module, self.mode, instance_id.clone(), options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .register_json("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .register_json("fail", |_: ()| async move {
                Err::<(), _>(RemoteError::new(ErrorKind::User, "nope").with_stack("at fail"))
            })
            .register("sleep", |_| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Bytes::new())
            })
    }

    fn call(name: &str, args: &str) -> Call {
        Call::new(name, Bytes::copy_from_slice(args.as_bytes()))
    }

    #[tokio::test]
    async fn test_direct_invoke() {
        let backend = LocalBackend::direct(registry());
        let cancel = CancellationToken::new();
        let ret = backend
            .invoke(&call("add", "[2,3]"), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(ret.remote_start.is_some() && ret.remote_end.is_some());
        assert_eq!(ret.into_result().unwrap(), Bytes::from_static(b"5"));
    }

    #[tokio::test]
    async fn test_direct_user_error_and_unknown_function() {
        let backend = LocalBackend::direct(registry());
        let cancel = CancellationToken::new();
        let ret = backend
            .invoke(&call("fail", "null"), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ret.remote_error().unwrap().kind, ErrorKind::User);

        let err = backend
            .invoke(&call("missing", "null"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_serialization_errors() {
        let backend = LocalBackend::direct(registry());
        let ret = backend
            .invoke(&call("add", "\"two\""), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ret.remote_error().unwrap().kind, ErrorKind::Serialization);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_timeout() {
        let options = RuntimeOptions {
            timeout: Duration::from_secs(2),
            ..RuntimeOptions::default()
        };
        let backend = LocalBackend::new(registry(), Mode::Direct, InstanceId::new(), &options);
        let ret = backend
            .invoke(&call("sleep", "null"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ret.remote_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_queued_messages_flow_through_poll() {
        let backend = LocalBackend::queued(registry()).with_poll_wait(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let call = call("add", "[20,22]");
        assert!(backend.invoke(&call, &cancel).await.unwrap().is_none());

        let mut seen = Vec::new();
        while !seen.iter().any(|m| matches!(m, Message::Response(_))) {
            seen.extend(backend.poll(&cancel).await.unwrap().messages);
        }
        assert!(matches!(
            &seen[0],
            Message::FunctionStarted { call_id } if *call_id == call.call_id
        ));
        let response = seen
            .into_iter()
            .find_map(|m| match m {
                Message::Response(ret) => Some(ret),
                _ => None,
            })
            .unwrap();
        assert_eq!(response.into_result().unwrap(), Bytes::from_static(b"42"));
        assert!(backend.response_channel_id().unwrap().ends_with("-responses"));
    }

    #[tokio::test]
    async fn test_queued_unknown_function_is_dead_lettered() {
        let backend = LocalBackend::queued(registry());
        let cancel = CancellationToken::new();
        let call = call("missing", "null");
        backend.invoke(&call, &cancel).await.unwrap();
        let polled = backend.poll(&cancel).await.unwrap();
        assert_eq!(
            polled.messages,
            vec![Message::DeadLetter {
                call_id: call.call_id.clone(),
                reason: "function missing is not registered".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let backend = LocalBackend::queued(registry()).with_poll_wait(Duration::from_millis(200));
        let polled = backend.poll(&CancellationToken::new()).await.unwrap();
        assert!(polled.messages.is_empty());
        assert!(!polled.is_full_batch);
    }

    #[tokio::test]
    async fn test_cleanup_stops_workers() {
        let backend = LocalBackend::queued(registry());
        let cancel = CancellationToken::new();
        backend.invoke(&call("sleep", "null"), &cancel).await.unwrap();
        backend.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(backend.active_workers(), 0);
        let err = backend
            .invoke(&Call::new("add", Bytes::new()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    fn delayed_flag(flag: Arc<AtomicBool>) -> FunctionRegistry {
        FunctionRegistry::new().register("touch", move |_| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(Bytes::new())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_aborts_running_handlers() {
        let flag = Arc::new(AtomicBool::new(false));
        let backend = LocalBackend::queued(delayed_flag(flag.clone()));
        backend
            .invoke(&call("touch", "null"), &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.cleanup(CleanupOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(backend.active_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_cancel_aborts_handler() {
        let flag = Arc::new(AtomicBool::new(false));
        let backend = LocalBackend::direct(delayed_flag(flag.clone()));
        let cancel = CancellationToken::new();
        let touch = call("touch", "null");
        let invoke = backend.invoke(&touch, &cancel);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (ret, ()) = tokio::join!(invoke, trigger);
        assert!(ret.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!flag.load(Ordering::SeqCst));
    }
}
