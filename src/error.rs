//! Error types for the resilience core

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error type accepted at the caller boundary.
pub type BoxError = tower::BoxError;

/// Result type alias for the resilience core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resilience core.
///
/// Every terminal failure produced by the wrappers in this crate is one of
/// these kinds, so callers can pattern-match to decide status mapping,
/// logging level, or retry-after handling.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation did not settle before its deadline
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// An external cancellation signal fired before the operation settled
    #[error("operation cancelled: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Cancelled { reason: Option<String> },

    /// The call was rejected without execution because the circuit is open
    #[error("circuit '{key}' is open; next attempt allowed in {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// The retry loop gave up; carries the last underlying error
    #[error("operation '{operation}' exhausted {attempts} attempt(s)")]
    RetryExhausted {
        operation: String,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    /// One or more tasks of a settle-all batch failed
    #[error("'{operation}': {} parallel task(s) failed", .errors.len())]
    Aggregate { operation: String, errors: Vec<Error> },

    /// Failure raised by the protected operation itself
    #[error("operation failed: {source}")]
    Operation {
        #[source]
        source: BoxError,
        retryable: bool,
    },

    /// An error wrapped with call-site context
    #[error(transparent)]
    Context(Box<ContextualError>),
}

impl Error {
    /// Wrap a caller-side failure, treating it as transient.
    pub fn operation(source: impl Into<BoxError>) -> Self {
        Error::Operation {
            source: source.into(),
            retryable: true,
        }
    }

    /// Wrap a caller-side failure that must not be retried.
    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Error::Operation {
            source: source.into(),
            retryable: false,
        }
    }

    /// Stable machine-readable tag for the error kind.
    pub fn code(&self) -> &str {
        match self {
            Error::Timeout { .. } => "TIMEOUT",
            Error::Cancelled { .. } => "CANCELLED",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Aggregate { .. } => "AGGREGATE",
            Error::Operation { .. } => "OPERATION_FAILED",
            Error::Context(c) => &c.code,
        }
    }

    /// Whether a retry loop may try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => false,
            Error::CircuitOpen { .. } => false,
            Error::RetryExhausted { .. } => false,
            Error::Aggregate { .. } => false,
            Error::Operation { retryable, .. } => *retryable,
            Error::Context(c) => c.retryable,
        }
    }

    /// Whether the failure was caused by a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled { .. } => true,
            Error::Context(c) => c.cancelled,
            _ => false,
        }
    }

    /// Innermost error in the source chain.
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = std::error::Error::source(current) {
            current = next;
        }
        current
    }

    /// Attach call-site context, preserving any contexts already recorded.
    ///
    /// Wrapping a plain error produces a [`ContextualError`] whose chain
    /// holds exactly the new context. Wrapping an already-contextual error
    /// appends to the chain instead of discarding it, so no context is lost
    /// across re-wraps.
    pub fn with_context(self, ctx: ErrorContext) -> Error {
        match self {
            Error::Context(mut contextual) => {
                contextual.chained_contexts.push(ctx.clone());
                contextual.context = ctx;
                Error::Context(contextual)
            }
            other => {
                let message = other.to_string();
                let code = other.code().to_string();
                let retryable = other.is_retryable();
                let cancelled = other.is_cancelled();
                Error::Context(Box::new(ContextualError {
                    message,
                    code,
                    chained_contexts: vec![ctx.clone()],
                    context: ctx,
                    retryable,
                    cancelled,
                    source: Some(Box::new(other)),
                }))
            }
        }
    }
}

impl From<BoxError> for Error {
    fn from(source: BoxError) -> Self {
        Error::Operation {
            source,
            retryable: true,
        }
    }
}

/// Metadata describing where a failure crossed a call-site boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub service: String,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            service: service.into(),
            request_id: None,
            user_id: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Mint a fresh correlation id when the caller has none to thread through.
    pub fn generated_correlation_id(mut self) -> Self {
        self.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        self
    }
}

/// An error carrying the contexts of every boundary it passed through.
///
/// `chained_contexts` is ordered oldest first and always contains the
/// current `context` as its last element.
#[derive(Debug, Error)]
#[error("{message} (operation '{}')", .context.operation)]
pub struct ContextualError {
    pub message: String,
    pub code: String,
    pub context: ErrorContext,
    pub chained_contexts: Vec<ErrorContext>,
    pub retryable: bool,
    pub cancelled: bool,
    #[source]
    pub source: Option<Box<Error>>,
}

/// Extension adding context-wrapping to `Result`.
pub trait ResultExt<T> {
    fn context(self, ctx: ErrorContext) -> Result<T>;
    fn with_context<F: FnOnce() -> ErrorContext>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| e.with_context(ctx))
    }

    fn with_context<F: FnOnce() -> ErrorContext>(self, f: F) -> Result<T> {
        self.map_err(|e| e.with_context(f()))
    }
}
