//! Correlation table of outstanding calls.
//!
//! Exactly one [`PendingRequest`] exists per live call id. Final resolution
//! removes the entry and hands the result to the waiting caller in one step,
//! so a late duplicate response finds nothing and is dropped.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::call::{Call, Return};
use crate::types::{CallId, Error, Result};

/// Receives the final result of a call.
pub type ResultReceiver = oneshot::Receiver<Result<Return>>;
/// Receives failures of individual attempts, which the call driver may retry.
pub type FailureReceiver = mpsc::UnboundedReceiver<Error>;

/// An outstanding call.
#[derive(Debug)]
pub struct PendingRequest {
    pub call: Arc<Call>,
    pub created_at: DateTime<Utc>,
    executing: bool,
    tx: oneshot::Sender<Result<Return>>,
    failures: mpsc::UnboundedSender<Error>,
}

/// What happened to a response handed to [`CorrelationTable::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The call was resolved and removed.
    Resolved,
    /// A retryable remote failure was passed to the call driver.
    Reported,
    /// No pending call has this id; the response was dropped.
    Unknown,
}

/// Concurrent map from call id to pending request.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<CallId, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call. Call ids are never reused; a duplicate is an
    /// internal error.
    pub fn insert(&self, call: Arc<Call>) -> Result<(ResultReceiver, FailureReceiver)> {
        match self.entries.entry(call.call_id.clone()) {
            Entry::Occupied(_) => Err(Error::internal(format!(
                "duplicate call id {}",
                call.call_id
            ))),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let (failures, failures_rx) = mpsc::unbounded_channel();
                slot.insert(PendingRequest {
                    call,
                    created_at: Utc::now(),
                    executing: false,
                    tx,
                    failures,
                });
                Ok((rx, failures_rx))
            }
        }
    }

    /// Route a response to its call.
    ///
    /// Retryable remote failures go to the call driver and leave the entry in
    /// place; anything else resolves the call.
    pub fn complete(&self, ret: Return) -> Completion {
        let retryable = ret
            .remote_error()
            .map(|err| err.kind.is_retryable())
            .unwrap_or(false);

        if retryable {
            let call_id = ret.call_id.clone();
            let reported = match ret.into_result() {
                Err(err) => self.report_failure(&call_id, err),
                Ok(_) => false,
            };
            return if reported {
                Completion::Reported
            } else {
                Completion::Unknown
            };
        }

        match self.entries.remove(&ret.call_id) {
            Some((call_id, pending)) => {
                tracing::debug!("call_resolved: call_id={}", call_id);
                let _ = pending.tx.send(Ok(ret));
                Completion::Resolved
            }
            None => {
                tracing::warn!("unknown_call_id: call_id={}", ret.call_id);
                Completion::Unknown
            }
        }
    }

    /// Report a failed attempt to the call's driver without resolving it.
    pub fn report_failure(&self, call_id: &CallId, error: Error) -> bool {
        match self.entries.get(call_id) {
            Some(pending) => pending.failures.send(error).is_ok(),
            None => {
                tracing::warn!("unknown_call_id: call_id={}, error={}", call_id, error);
                false
            }
        }
    }

    /// Resolve a call with an error.
    pub fn reject(&self, call_id: &CallId, error: Error) -> bool {
        match self.entries.remove(call_id) {
            Some((_, pending)) => {
                tracing::debug!("call_rejected: call_id={}, kind={}", call_id, error.kind());
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding call. Returns how many were rejected.
    pub fn reject_all(&self, error: &Error) -> usize {
        let ids: Vec<CallId> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter(|call_id| self.reject(call_id, error.clone()))
            .count()
    }

    /// Drop a call without resolving it.
    pub fn remove(&self, call_id: &CallId) -> bool {
        self.entries.remove(call_id).is_some()
    }

    /// Record that a worker acknowledged the call as started.
    pub fn mark_executing(&self, call_id: &CallId) -> bool {
        match self.entries.get_mut(call_id) {
            Some(mut pending) => {
                pending.executing = true;
                true
            }
            None => false,
        }
    }

    pub fn is_executing(&self, call_id: &CallId) -> bool {
        self.entries
            .get(call_id)
            .map(|pending| pending.executing)
            .unwrap_or(false)
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.entries.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
