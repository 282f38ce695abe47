//! Error types for scheduler operations.
//!
//! The scheduler surfaces every failure through a single [`JobError`] type.
//! Callers discriminate the interesting cases through boolean predicates
//! (`is_cancellation`, `is_interruption`, `is_timeout`, `is_rejection`)
//! rather than a type hierarchy; exactly one predicate is true for any
//! failure raised by a blocking accessor. A plain runtime failure thrown by
//! user work is wrapped with the original as cause and all four predicates
//! false.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by job scheduling, execution and blocking accessors.
///
/// The enum is cheaply cloneable so that every waiter on a future observes
/// the same failure; the user-work cause is shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The job was cancelled before or during execution.
    #[error("job cancelled [job={0}]")]
    Cancelled(String),
    /// A blocking wait was interrupted by a forced cancellation.
    #[error("interrupted while waiting [what={0}]")]
    Interrupted(String),
    /// A blocking wait elapsed before the awaited condition held.
    #[error("timeout elapsed while waiting [what={0}]")]
    Timeout(String),
    /// The executor refused the submission (saturation or shutdown race).
    #[error("job rejected by the executor [job={0}]")]
    Rejected(String),
    /// Input validation or an API precondition failed before any future
    /// was created. Never wrapped as a job failure.
    #[error("assertion failed: {0}")]
    Assertion(String),
    /// User work returned an error or panicked; the original failure is the
    /// cause.
    #[error("job failed: {0}")]
    Failed(Arc<anyhow::Error>),
}

impl JobError {
    /// Wrap a user-work failure.
    pub fn failed(cause: anyhow::Error) -> Self {
        Self::Failed(Arc::new(cause))
    }

    /// `true` if this failure represents a (soft or forced) cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// `true` if this failure represents an interrupted blocking wait.
    #[must_use]
    pub const fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// `true` if this failure represents an elapsed wait timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// `true` if this failure represents an executor rejection.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
