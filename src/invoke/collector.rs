//! Result collector for queued backends.
//!
//! A [`Pump`] of pollers drains the backend's response channel and routes
//! each message to the correlation table. Poller concurrency floats between
//! a floor and a cap: after a full batch it scales with the backlog of
//! pending calls, otherwise it falls back to the floor.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::pending::{Completion, CorrelationTable};
use super::stats::UsageTracker;
use crate::provider::{Backend, Message};
use crate::throttle::{Funnel, Pump};
use crate::types::{Error, RuntimeOptions};

/// Pause after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Target poller count.
///
/// `ceil(backlog / batch_size)` clamped to `[min, max]` after a full batch,
/// `min` otherwise.
pub fn adaptive_concurrency(
    full_batch: bool,
    backlog: usize,
    batch_size: usize,
    min: usize,
    max: usize,
) -> usize {
    if !full_batch {
        return min;
    }
    backlog.div_ceil(batch_size.max(1)).clamp(min, max.max(min))
}

/// Apply one queue message to the correlation table.
pub fn dispatch(table: &CorrelationTable, usage: &UsageTracker, message: Message) {
    match message {
        Message::Response(ret) => {
            if table.complete(ret) == Completion::Unknown {
                tracing::debug!("collector_response_dropped");
            }
        }
        Message::FunctionStarted { call_id } => {
            if !table.mark_executing(&call_id) {
                tracing::debug!("collector_started_unknown: call_id={}", call_id);
            }
        }
        Message::DeadLetter { call_id, reason } => {
            tracing::warn!("dead_letter: call_id={}, reason={}", call_id, reason);
            table.report_failure(&call_id, Error::delivery(reason));
        }
        Message::Metrics(sample) => usage.record(&sample),
        Message::StopQueue => tracing::trace!("collector_stopqueue_ignored"),
    }
}

/// Background poller pool bound to one runtime.
#[derive(Debug)]
pub struct ResultCollector {
    pump: Pump,
}

impl ResultCollector {
    /// Start polling `backend` until `cancel` fires.
    pub fn start<B: Backend>(
        backend: Arc<B>,
        table: Arc<CorrelationTable>,
        usage: Arc<UsageTracker>,
        options: &RuntimeOptions,
        cancel: &CancellationToken,
    ) -> Self {
        let min = options.collector_min_concurrency.max(1);
        let max = options.collector_max_concurrency.max(min);
        let batch_size = options.collector_batch_size;

        let funnel = Funnel::new(min);
        let scaler = funnel.clone();
        let poll_cancel = cancel.clone();
        let pump = Pump::with_funnel(funnel, move || {
            let backend = backend.clone();
            let table = table.clone();
            let usage = usage.clone();
            let scaler = scaler.clone();
            let cancel = poll_cancel.clone();
            async move {
                let polled = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    polled = backend.poll(&cancel) => polled,
                };
                match polled {
                    Ok(batch) => {
                        let target =
                            adaptive_concurrency(batch.is_full_batch, table.len(), batch_size, min, max);
                        if target != scaler.max_concurrency() {
                            tracing::debug!(
                                "collector_resized: from={}, to={}",
                                scaler.max_concurrency(),
                                target
                            );
                            scaler.set_max_concurrency(target);
                        }
                        for message in batch.messages {
                            dispatch(&table, &usage, message);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("collector_poll_failed: error={}", err);
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        }
                    }
                }
                Ok(())
            }
        })
        .stop_on(cancel);
        pump.start();
        tracing::debug!("collector_started: min={}, max={}", min, max);
        Self { pump }
    }

    pub fn concurrency(&self) -> usize {
        self.pump.max_concurrency()
    }

    /// Stop polling and wait for in-flight polls.
    pub async fn drain(&self) {
        self.pump.drain().await;
    }
}
