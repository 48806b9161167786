//! Error types for the messaging runtime
//!
//! One taxonomy covers every subsystem: input validation, lookup misses,
//! duplicates, optimistic-concurrency conflicts, throttling, transient and
//! fatal processing failures, cancellation, compensation rollups, timeouts,
//! and disabled optional features.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Error raised by one compensation action during a rollback run.
///
/// Compensation runs never surface these individually; they are always
/// collected into [`MessagingError::CompensationFailed`].
#[derive(Debug, Error)]
#[error("compensation action '{action_name}' failed: {source}")]
pub struct CompensationActionError {
    /// Name the action was registered under
    pub action_name: String,
    /// The failure raised by the action
    #[source]
    pub source: Box<MessagingError>,
}

/// Error types for the messaging runtime
#[derive(Debug, Error)]
pub enum MessagingError {
    /// A caller-supplied argument or option is invalid
    #[error("invalid {parameter}: {reason}")]
    InvalidInput {
        /// Parameter or option name
        parameter: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// A validator rejected the message before processing
    #[error("message validation failed: {}", errors.join("; "))]
    ValidationFailed {
        /// Validator errors in declaration order
        errors: Vec<String>,
    },

    /// A referenced entity does not exist
    #[error("{kind} not found: {id}{hint}")]
    NotFound {
        /// Entity kind (schedule, saga, ...)
        kind: &'static str,
        /// Identifier that missed
        id: String,
        /// Guidance appended to the message (may be empty)
        hint: &'static str,
    },

    /// An entity with the same identifier already exists
    #[error("{kind} already exists: {id}{hint}")]
    Duplicate {
        /// Entity kind (schedule, saga, ...)
        kind: &'static str,
        /// Conflicting identifier
        id: String,
        /// Guidance appended to the message (may be empty)
        hint: &'static str,
    },

    /// Optimistic concurrency check failed on a saga update
    #[error(
        "concurrency conflict on saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Saga correlation id
        correlation_id: Uuid,
        /// Version the caller held
        expected: u64,
        /// Version found in the repository
        actual: u64,
    },

    /// Rate limit refused the call
    #[error("rate limit exceeded: {reason} (retry after {retry_after:?})")]
    Throttled {
        /// Refusal reason
        reason: String,
        /// How long until enough tokens refill
        retry_after: Duration,
    },

    /// Transient failure, eligible for retry
    #[error("transient failure: {reason}")]
    Transient {
        /// What failed
        reason: String,
    },

    /// Critical host error, never retried
    #[error("fatal error: {reason}")]
    Fatal {
        /// What failed
        reason: String,
    },

    /// The operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// One or more compensation actions failed during rollback
    #[error("compensation failed for {} action(s)", failures.len())]
    CompensationFailed {
        /// One entry per failed action, in execution (LIFO) order
        failures: Vec<CompensationActionError>,
    },

    /// The operation exceeded its deadline
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Configured deadline
        duration: Duration,
    },

    /// An optional facade feature was invoked without being configured
    #[error("{feature} functionality is not enabled. {hint}")]
    FeatureNotEnabled {
        /// Feature name (Queue, Outbox, Inbox)
        feature: &'static str,
        /// Builder call that enables it
        hint: &'static str,
    },

    /// The component was shut down before the call
    #[error("{component} has been disposed")]
    Disposed {
        /// Component name
        component: &'static str,
    },

    /// A storage collaborator failed
    #[error("storage error: {reason}")]
    Storage {
        /// Underlying cause
        reason: String,
    },

    /// Serialization of a message or metadata value failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other collaborator failure
    #[error("internal error: {reason}")]
    Internal {
        /// What failed
        reason: String,
    },
}

impl MessagingError {
    /// Transient failures are eligible for retry under the default policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::Throttled { .. }
        )
    }

    /// Fatal failures must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Whether this error reports cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error reports an optimistic-concurrency conflict.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Shorthand for an invalid-argument error.
    pub fn invalid_input(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            parameter,
            reason: reason.into(),
        }
    }

    /// Shorthand for a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Shorthand for an internal failure.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
