//! Application error types.
//!
//! Every failure surfaces as a single [`Error`] carrying a machine-checkable
//! [`ErrorKind`], the original cause chain, and diagnostic context
//! (function name, argument digest, log reference).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments or return value could not round-trip through the wire encoding.
    Serialization,
    /// Remote execution exceeded its configured budget.
    Timeout,
    /// Remote worker exceeded its memory ceiling.
    OutOfMemory,
    /// The backend could not route a call to a live worker (dead letter).
    Delivery,
    /// The runtime was torn down while the call was outstanding.
    Cancelled,
    /// The remote function itself failed.
    User,
    /// The backend failed to create or manage its resources.
    Infrastructure,
    /// A resource or call was not found.
    NotFound,
    /// Invalid input supplied by the caller.
    Validation,
    /// Invariant violation inside the runtime.
    Internal,
    /// Local I/O failure.
    Io,
}

impl ErrorKind {
    /// Whether the invocation pipeline may retry this failure on its own.
    ///
    /// Out-of-memory failures are not retried: the same workload would hit
    /// the same ceiling.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Delivery)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Serialization => "serialization",
            ErrorKind::Timeout => "timeout",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::User => "user",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic context attached to an error as it propagates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub function_name: Option<String>,
    /// Short SHA-256 digest of the serialized arguments.
    pub args_digest: Option<String>,
    pub log_url: Option<String>,
    /// Stack trace reported by the remote side for user errors.
    pub remote_stack: Option<String>,
}

/// Main error type for the runtime.
#[derive(Error, Debug, Clone)]
#[error("{kind} error: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Attach an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Merge diagnostic context; fields already set are kept.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        let ctx = &mut self.context;
        ctx.function_name = ctx.function_name.take().or(context.function_name);
        ctx.args_digest = ctx.args_digest.take().or(context.args_digest);
        ctx.log_url = ctx.log_url.take().or(context.log_url);
        ctx.remote_stack = ctx.remote_stack.take().or(context.remote_stack);
        self
    }

    pub fn with_function(mut self, function_name: impl Into<String>) -> Self {
        if self.context.function_name.is_none() {
            self.context.function_name = Some(function_name.into());
        }
        self
    }
}

// Convenience constructors
impl Error {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, msg)
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Delivery, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, msg)
    }

    pub fn user(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, msg)
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string()).with_cause(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Error::new(kind, err.to_string()).with_cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() {
            ErrorKind::Serialization
        } else if err.is_connect() || err.is_request() {
            ErrorKind::Delivery
        } else {
            ErrorKind::Infrastructure
        };
        Error::new(kind, err.to_string()).with_cause(err)
    }
}
