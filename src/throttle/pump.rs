//! Self-refilling background worker pool.
//!
//! A [`Pump`] keeps up to `concurrency` invocations of one worker function
//! in flight, resubmitting the worker to an internal [`Funnel`] every time a
//! slot frees up, until stopped.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::funnel::Funnel;
use crate::types::Result;

type Worker = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Background worker pool driven by a funnel.
pub struct Pump {
    funnel: Funnel,
    worker: Worker,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Pump {
    pub fn new<F, Fut>(concurrency: usize, worker: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_funnel(Funnel::new(concurrency.max(1)), worker)
    }

    /// Build a pump over an existing funnel, so the worker itself can
    /// resize the pump through a clone of it.
    pub fn with_funnel<F, Fut>(funnel: Funnel, worker: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            funnel,
            worker: Arc::new(move || worker().boxed()),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Stop automatically when `token` is cancelled.
    pub fn stop_on(mut self, token: &CancellationToken) -> Self {
        self.stop = token.child_token();
        self
    }

    /// Start refilling. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let funnel = self.funnel.clone();
        let worker = self.worker.clone();
        let stop = self.stop.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let slot = tokio::select! {
                    _ = stop.cancelled() => break,
                    slot = funnel.acquire() => slot,
                };
                let slot = match slot {
                    Ok(slot) => slot,
                    Err(err) => {
                        tracing::debug!("pump_stopped: reason={}", err);
                        break;
                    }
                };
                if stop.is_cancelled() {
                    break;
                }
                let run = worker();
                tracker.spawn(async move {
                    let _slot = slot;
                    if let Err(err) = run.await {
                        tracing::warn!("pump_worker_failed: error={}", err);
                    }
                });
            }
        });
    }

    /// Stop submitting new workers. In-flight workers run to completion.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for in-flight workers to finish.
    pub async fn drain(&self) {
        self.stop();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn set_max_concurrency(&self, concurrency: usize) {
        self.funnel.set_max_concurrency(concurrency.max(1));
    }

    pub fn max_concurrency(&self) -> usize {
        self.funnel.max_concurrency()
    }

    /// Workers currently running.
    pub fn in_flight(&self) -> usize {
        self.funnel.executing_len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("funnel", &self.funnel)
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}
