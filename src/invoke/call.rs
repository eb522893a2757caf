//! Call and return payloads exchanged with backends.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallId, Error, ErrorContext, ErrorKind, Result};

/// One physical request for a logical call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: CallId,
    pub function_name: String,
    /// Serialized arguments (JSON for typed calls).
    #[serde(with = "base64_bytes")]
    pub args: Bytes,
    /// Where a queued worker should publish its response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel_id: Option<String>,
}

impl Call {
    pub fn new(function_name: impl Into<String>, args: Bytes) -> Self {
        Self {
            call_id: CallId::new(),
            function_name: function_name.into(),
            args,
            response_channel_id: None,
        }
    }

    pub fn with_response_channel(mut self, channel: Option<String>) -> Self {
        self.response_channel_id = channel;
        self
    }
}

/// Failure reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn into_error(self, log_url: Option<String>) -> Error {
        Error::new(self.kind, self.message).with_context(ErrorContext {
            remote_stack: self.stack,
            log_url,
            ..Default::default()
        })
    }
}

/// Result of a remote execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    #[serde(rename = "ok")]
    Success {
        #[serde(with = "base64_bytes")]
        value: Bytes,
    },
    #[serde(rename = "error")]
    Failure { error: RemoteError },
}

/// A response for one call, produced remotely and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub call_id: CallId,
    pub outcome: Outcome,
    #[serde(default)]
    pub remote_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_end: Option<DateTime<Utc>>,
    /// Identifier of the worker that executed the call.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Peak memory of the worker in bytes.
    #[serde(default)]
    pub memory_usage: Option<u64>,
    #[serde(default)]
    pub log_url: Option<String>,
    /// Local send time of the attempt that produced this return, when the
    /// backend answered that attempt inline.
    #[serde(skip)]
    pub attempt_sent: Option<DateTime<Utc>>,
}

impl Return {
    pub fn success(call_id: CallId, value: Bytes) -> Self {
        Self::with_outcome(call_id, Outcome::Success { value })
    }

    pub fn failure(call_id: CallId, error: RemoteError) -> Self {
        Self::with_outcome(call_id, Outcome::Failure { error })
    }

    fn with_outcome(call_id: CallId, outcome: Outcome) -> Self {
        Self {
            call_id,
            outcome,
            remote_start: None,
            remote_end: None,
            instance_id: None,
            memory_usage: None,
            log_url: None,
            attempt_sent: None,
        }
    }

    pub fn with_timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.remote_start = Some(start);
        self.remote_end = Some(end);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// The remote error, if the call failed remotely.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match &self.outcome {
            Outcome::Failure { error } => Some(error),
            Outcome::Success { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<Bytes> {
        match self.outcome {
            Outcome::Success { value } => Ok(value),
            Outcome::Failure { error } => Err(error.into_error(self.log_url)),
        }
    }
}

/// Serde adapter encoding bytes as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
