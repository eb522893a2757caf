//! Transport abstraction.
//!
//! A [`Backend`] moves [`Call`]s to remote workers and brings [`Return`]s
//! back, either inline (direct mode) or through a response queue drained by
//! [`Backend::poll`] (queued mode). A [`Provider`] creates the backend's
//! remote resources for one runtime instance.

pub mod cost;
pub mod https;
pub mod local;
pub mod process;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::invoke::{Call, FunctionStats, Return};
use crate::types::{CallId, Error, InstanceId, Result, RuntimeOptions};

pub use cost::{CostBreakdown, CostItem, Pricing};
pub use https::{HttpsBackend, HttpsEndpoint, HttpsProvider};
pub use local::{FunctionRegistry, LocalBackend, LocalProvider};
pub use process::{ProcessBackend, ProcessCommand, ProcessProvider};

/// Prefix of every remote resource name.
pub const RESOURCE_PREFIX: &str = "faast-";

/// Deterministic resource name for a runtime instance.
pub fn resource_name(instance_id: &InstanceId) -> String {
    format!("{}{}", RESOURCE_PREFIX, instance_id)
}

/// How results come back from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// `invoke` returns the result.
    Direct,
    /// Results arrive later through `poll`.
    Queued,
}

/// What `cleanup` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub delete_resources: bool,
    pub delete_caches: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            delete_resources: true,
            delete_caches: false,
        }
    }
}

/// One remote execution backend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn mode(&self) -> Mode;

    /// Send one physical attempt of `call`.
    ///
    /// Direct backends return the result; queued backends return `None` once
    /// the request has been enqueued. Returns `Ok(None)` early if `cancel`
    /// fires.
    async fn invoke(&self, call: &Call, cancel: &CancellationToken) -> Result<Option<Return>>;

    /// Receive a batch of queued messages.
    async fn poll(&self, _cancel: &CancellationToken) -> Result<PollResult> {
        Ok(PollResult::default())
    }

    /// Channel queued workers publish responses to.
    fn response_channel_id(&self) -> Option<String> {
        None
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<()>;

    fn cost_snapshot(&self, _stats: &FunctionStats) -> CostBreakdown {
        CostBreakdown::default()
    }
}

/// Creates a backend for one runtime instance.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Reference to the code the backend will run.
    type Module: Send + 'static;
    type Backend: Backend;

    fn name(&self) -> &str;

    /// Create remote resources. On failure whatever was created is removed
    /// before the error is returned.
    async fn initialize(
        &self,
        module: Self::Module,
        instance_id: &InstanceId,
        options: &RuntimeOptions,
    ) -> Result<Self::Backend>;
}

/// Run `create`; if it fails, run `rollback` best-effort and report an
/// infrastructure error carrying the original failure.
pub async fn with_rollback<T, C, R, RFut>(create: C, rollback: R) -> Result<T>
where
    C: Future<Output = Result<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<()>>,
{
    match create.await {
        Ok(value) => Ok(value),
        Err(err) => {
            if let Err(cleanup_err) = rollback().await {
                tracing::warn!("rollback_failed: error={}", cleanup_err);
            }
            Err(
                Error::infrastructure(format!("initialization failed: {}", err.message()))
                    .with_cause(err),
            )
        }
    }
}

// =============================================================================
// Queue messages
// =============================================================================

/// Kind attribute of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Response,
    FunctionStarted,
    DeadLetter,
    AuxiliaryMetrics,
    StopQueue,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Response => "response",
            MessageKind::FunctionStarted => "functionstarted",
            MessageKind::DeadLetter => "deadletter",
            MessageKind::AuxiliaryMetrics => "auxiliary-metrics",
            MessageKind::StopQueue => "stopqueue",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "response" => Ok(MessageKind::Response),
            "functionstarted" => Ok(MessageKind::FunctionStarted),
            "deadletter" => Ok(MessageKind::DeadLetter),
            "auxiliary-metrics" => Ok(MessageKind::AuxiliaryMetrics),
            "stopqueue" => Ok(MessageKind::StopQueue),
            other => Err(Error::validation(format!("unknown message kind: {other}"))),
        }
    }
}

/// CPU and memory sample reported by a queued worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub call_id: CallId,
    pub function_name: String,
    /// Seconds since the call started on the worker.
    pub elapsed_secs: f64,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub memory_rss: u64,
}

/// Decoded queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Return),
    FunctionStarted { call_id: CallId },
    DeadLetter { call_id: CallId, reason: String },
    Metrics(MetricsSample),
    StopQueue,
}

/// Queue message as carried by the transport: attributes plus a body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireMessage {
    pub attributes: BTreeMap<String, String>,
    pub body: Bytes,
}

const KIND_ATTRIBUTE: &str = "kind";
const CALL_ID_ATTRIBUTE: &str = "call_id";

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Response(_) => MessageKind::Response,
            Message::FunctionStarted { .. } => MessageKind::FunctionStarted,
            Message::DeadLetter { .. } => MessageKind::DeadLetter,
            Message::Metrics(_) => MessageKind::AuxiliaryMetrics,
            Message::StopQueue => MessageKind::StopQueue,
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Message::Response(ret) => Some(&ret.call_id),
            Message::FunctionStarted { call_id } | Message::DeadLetter { call_id, .. } => {
                Some(call_id)
            }
            Message::Metrics(sample) => Some(&sample.call_id),
            Message::StopQueue => None,
        }
    }

    pub fn to_wire(&self) -> Result<WireMessage> {
        let mut attributes = BTreeMap::new();
        attributes.insert(KIND_ATTRIBUTE.to_string(), self.kind().as_str().to_string());
        if let Some(call_id) = self.call_id() {
            attributes.insert(CALL_ID_ATTRIBUTE.to_string(), call_id.to_string());
        }
        let body = match self {
            Message::Response(ret) => Bytes::from(serde_json::to_vec(ret)?),
            Message::Metrics(sample) => Bytes::from(serde_json::to_vec(sample)?),
            Message::DeadLetter { reason, .. } => Bytes::from(reason.clone()),
            Message::FunctionStarted { .. } | Message::StopQueue => Bytes::new(),
        };
        Ok(WireMessage { attributes, body })
    }

    pub fn from_wire(wire: &WireMessage) -> Result<Self> {
        let kind: MessageKind = wire
            .attributes
            .get(KIND_ATTRIBUTE)
            .ok_or_else(|| Error::validation("queue message without kind attribute"))?
            .parse()?;
        let call_id = || -> Result<CallId> {
            let raw = wire
                .attributes
                .get(CALL_ID_ATTRIBUTE)
                .ok_or_else(|| Error::validation(format!("{kind} message without call id")))?;
            CallId::from_string(raw.clone()).map_err(Error::validation)
        };
        Ok(match kind {
            MessageKind::Response => Message::Response(serde_json::from_slice(&wire.body)?),
            MessageKind::AuxiliaryMetrics => Message::Metrics(serde_json::from_slice(&wire.body)?),
            MessageKind::FunctionStarted => Message::FunctionStarted { call_id: call_id()? },
            MessageKind::DeadLetter => Message::DeadLetter {
                call_id: call_id()?,
                reason: String::from_utf8_lossy(&wire.body).into_owned(),
            },
            MessageKind::StopQueue => Message::StopQueue,
        })
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult {
    pub messages: Vec<Message>,
    /// The poll returned as many messages as it could; more are likely waiting.
    pub is_full_batch: bool,
}
