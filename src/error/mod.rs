// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for protected calls.
//!
//! Every expected failure mode of [`ResilienceOrchestrator::execute`] is returned
//! as a [`ResilienceError`]; nothing on the call path panics. Use
//! [`ResilienceError::kind`] to branch on the taxonomy tag without matching on
//! the full variant.
//!
//! [`ResilienceOrchestrator::execute`]: crate::ResilienceOrchestrator::execute

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by a protected callable.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Taxonomy tag attached to every failure the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retryable downstream failure (connectivity, 5xx-equivalent).
    Transient,
    /// Non-retryable downstream failure (validation, 4xx-equivalent).
    Permanent,
    /// A single attempt exceeded its per-attempt duration.
    Timeout,
    /// Fail-fast rejection by the circuit breaker; the call was never attempted.
    CircuitOpen,
    /// Capacity or queue exceeded; the call was never attempted.
    BulkheadRejected,
    /// Every allowed attempt failed with a retryable error.
    ExhaustedRetries,
    /// The caller cancelled the call.
    Cancelled,
    /// The caller-supplied deadline passed.
    DeadlineExceeded,
    /// Unknown operation or malformed policy.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BulkheadRejected => "bulkhead_rejected",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// Convenience error for callables that want to tag their own failures.
///
/// The built-in `"default"` retry predicate treats [`CallError::Permanent`] as
/// non-retryable and every other error as retryable.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CallError {
    /// Create a transient (retryable) error.
    pub fn transient(msg: impl Into<String>) -> Self {
        CallError::Transient(msg.into())
    }

    /// Create a permanent (non-retryable) error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        CallError::Permanent(msg.into())
    }
}

/// Failure of a single attempt, before retry classification.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The attempt did not finish within its per-attempt duration.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The callable returned an error.
    #[error("{0}")]
    Failed(#[source] BoxError),
}

impl AttemptError {
    /// Borrow the callable's error, if this was not a timeout.
    pub fn as_failure(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            AttemptError::Failed(e) => Some(e.as_ref()),
            AttemptError::Timeout(_) => None,
        }
    }

    /// Returns `true` if the attempt timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::Timeout(_))
    }
}

/// Why the bulkhead turned a call away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// All slots busy and the wait queue is full.
    QueueFull,
    /// Queued, but no slot freed up within `queue_timeout`.
    QueueTimeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull => f.write_str("queue_full"),
            RejectReason::QueueTimeout => f.write_str("queue_timeout"),
        }
    }
}

/// Terminal error returned to the caller of a protected operation.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("{operation}: permanent failure after {attempts} attempt(s): {source}")]
    Permanent {
        operation: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("{operation}: retries exhausted after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    #[error("{operation}: circuit breaker is open (retry after {retry_after:?})")]
    CircuitOpen {
        operation: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("{operation}: rejected by bulkhead ({reason})")]
    BulkheadRejected {
        operation: String,
        reason: RejectReason,
    },

    #[error("{operation}: cancelled by caller after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },

    #[error("{operation}: caller deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { operation: String, attempts: u32 },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid policy for {operation}: {reason}")]
    InvalidPolicy { operation: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResilienceError {
    /// The taxonomy tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Permanent { .. } => ErrorKind::Permanent,
            ResilienceError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::BulkheadRejected { .. } => ErrorKind::BulkheadRejected,
            ResilienceError::Cancelled { .. } => ErrorKind::Cancelled,
            ResilienceError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ResilienceError::UnknownOperation(_)
            | ResilienceError::InvalidPolicy { .. }
            | ResilienceError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Number of attempts that reached the callable.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::Permanent { attempts, .. }
            | ResilienceError::ExhaustedRetries { attempts, .. }
            | ResilienceError::CircuitOpen { attempts, .. }
            | ResilienceError::Cancelled { attempts, .. }
            | ResilienceError::DeadlineExceeded { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// The operation name, if the error is tied to one.
    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        match self {
            ResilienceError::Permanent { operation, .. }
            | ResilienceError::ExhaustedRetries { operation, .. }
            | ResilienceError::CircuitOpen { operation, .. }
            | ResilienceError::BulkheadRejected { operation, .. }
            | ResilienceError::Cancelled { operation, .. }
            | ResilienceError::DeadlineExceeded { operation, .. }
            | ResilienceError::InvalidPolicy { operation, .. } => Some(operation),
            ResilienceError::UnknownOperation(operation) => Some(operation),
            ResilienceError::Config(_) => None,
        }
    }

    /// The last underlying attempt error, for `Permanent` and `ExhaustedRetries`.
    #[must_use]
    pub fn last_error(&self) -> Option<&AttemptError> {
        match self {
            ResilienceError::Permanent { source, .. } => Some(source),
            ResilienceError::ExhaustedRetries { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Returns `true` if the call never reached the callable.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { attempts: 0, .. }
                | ResilienceError::BulkheadRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
