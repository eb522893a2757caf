//! Bounded-concurrency task admission.
//!
//! A [`Funnel`] admits tasks in submission order while fewer than
//! `max_concurrency` are executing. A finished task (success or failure)
//! releases its slot, which admits the next pending task; that release is
//! the only scheduling point. Completion order is unordered.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::retry::{retry_async, RetryPolicy};
use crate::types::{Error, Result};

/// Bounded-concurrency task queue. Cloning shares the same queue.
///
/// `max_concurrency == 0` means unbounded: every task runs immediately.
#[derive(Debug, Clone)]
pub struct Funnel {
    inner: Arc<FunnelInner>,
}

#[derive(Debug)]
struct FunnelInner {
    slots: Mutex<Slots>,
    pending: AtomicUsize,
    executing: AtomicUsize,
}

#[derive(Debug)]
struct Slots {
    // tokio's semaphore hands out permits in request order, which gives FIFO admission.
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    // Permits still held by tasks after the cap was lowered; forgotten on release.
    debt: usize,
}

impl Funnel {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(FunnelInner {
                slots: Mutex::new(Slots {
                    semaphore: Arc::new(Semaphore::new(max_concurrency)),
                    max_concurrency,
                    debt: 0,
                }),
                pending: AtomicUsize::new(0),
                executing: AtomicUsize::new(0),
            }),
        }
    }

    /// Run `task` once admitted.
    pub async fn push<T, F, Fut>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.acquire().await?;
        task().await
    }

    /// Run `task` once admitted, retrying failures per `retry`.
    ///
    /// The slot stays held across backoff sleeps.
    pub async fn push_with_retry<T, F, Fut>(&self, task: F, retry: &RetryPolicy) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = self.acquire().await?;
        retry_async(task, retry).await
    }

    /// Wait for admission and return the held slot.
    pub(crate) async fn acquire(&self) -> Result<FunnelSlot> {
        let semaphore = {
            let slots = self.inner.slots.lock();
            (slots.max_concurrency > 0).then(|| slots.semaphore.clone())
        };

        let permit = match &semaphore {
            None => None,
            Some(semaphore) => {
                let _waiting = CountGuard::enter(&self.inner.pending);
                let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                    Error::cancelled("funnel cleared before the task was admitted")
                })?;
                Some(permit)
            }
        };

        self.inner.executing.fetch_add(1, Ordering::SeqCst);
        Ok(FunnelSlot {
            inner: self.inner.clone(),
            semaphore,
            permit,
        })
    }

    /// Change the concurrency cap. Lowering it never interrupts running
    /// tasks; the surplus slots are retired as those tasks finish.
    ///
    /// Switching between bounded and unbounded is not supported.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let mut slots = self.inner.slots.lock();
        let current = slots.max_concurrency;
        if max_concurrency == current {
            return;
        }
        if max_concurrency == 0 || current == 0 {
            tracing::warn!(
                "funnel_resize_ignored: current={}, requested={}",
                current,
                max_concurrency
            );
            return;
        }

        if max_concurrency > current {
            let mut grow = max_concurrency - current;
            let repaid = grow.min(slots.debt);
            slots.debt -= repaid;
            grow -= repaid;
            slots.semaphore.add_permits(grow);
        } else {
            let shrink = current - max_concurrency;
            let forgotten = slots.semaphore.forget_permits(shrink);
            slots.debt += shrink - forgotten;
        }
        slots.max_concurrency = max_concurrency;
    }

    /// Drop all pending and executing bookkeeping without waiting.
    ///
    /// Tasks still waiting for admission fail with a cancellation error.
    /// Teardown only.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        slots.semaphore.close();
        slots.semaphore = Arc::new(Semaphore::new(slots.max_concurrency));
        slots.debt = 0;
        self.inner.executing.store(0, Ordering::SeqCst);
        self.inner.pending.store(0, Ordering::SeqCst);
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.slots.lock().max_concurrency
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn executing_len(&self) -> usize {
        self.inner.executing.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.pending_len() + self.executing_len()
    }
}

/// An admitted task's slot; released on drop.
#[derive(Debug)]
pub(crate) struct FunnelSlot {
    inner: Arc<FunnelInner>,
    semaphore: Option<Arc<Semaphore>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for FunnelSlot {
    fn drop(&mut self) {
        saturating_decrement(&self.inner.executing);

        let (Some(permit), Some(semaphore)) = (self.permit.take(), self.semaphore.take()) else {
            return;
        };
        let mut slots = self.inner.slots.lock();
        if slots.debt > 0 && Arc::ptr_eq(&slots.semaphore, &semaphore) {
            slots.debt -= 1;
            permit.forget();
        }
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        saturating_decrement(self.0);
    }
}

// Counters are reset by `clear()` while tasks may still be running.
fn saturating_decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}
