//! Error types for leasing operations.

use thiserror::Error;

use crate::util::{LeaseRef, ObjectRef};

/// Errors produced by the leasing engine.
#[derive(Debug, Clone, Error)]
pub enum DrydockError {
    /// A transition was attempted from a status that does not satisfy its
    /// precondition. Stored state is unchanged.
    #[error("{entity} status mismatch: expected {expected}, actually {actual}")]
    StateMismatch {
        /// The object the transition targeted.
        entity: String,
        /// Status (or statuses) the transition requires.
        expected: String,
        /// Status the object was actually in.
        actual: String,
    },
    /// One or more slot locks are already held by another object.
    #[error("slot lock conflict for {holder}: {}", .keys.join(", "))]
    SlotLockConflict {
        /// The object that tried to take the locks.
        holder: ObjectRef,
        /// The contended lock keys.
        keys: Vec<String>,
    },
    /// Every blueprint candidate failed to satisfy a lease.
    #[error("unable to allocate {lease}: {} candidate error(s)", .errors.len())]
    AllocationFailed {
        /// The lease being allocated.
        lease: LeaseRef,
        /// Per-candidate failures, in the order they were attempted.
        errors: Vec<DrydockError>,
    },
    /// A blueprint strategy's external interaction failed.
    #[error("strategy failure: {0}")]
    Strategy(String),
    /// The referenced object does not exist.
    #[error("no such object: {0}")]
    NotFound(String),
    /// An operation was invoked on an object that cannot support it.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// The acting identity may not see or change the object.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A waiter observed a lease that will never become active.
    #[error("{lease} is {status} and will never become active")]
    LeaseTerminated {
        /// The lease being waited on.
        lease: LeaseRef,
        /// The terminal status observed.
        status: String,
    },
    /// A bounded wait elapsed.
    #[error("operation timed out")]
    Timeout,
    /// The task queue refused a new task.
    #[error("task queue full: {0}")]
    QueueFull(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DrydockError {
    /// Build a state-mismatch error.
    pub fn state_mismatch(
        entity: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::StateMismatch {
            entity: entity.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// True for failures the allocator treats as "try the next candidate".
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::SlotLockConflict { .. } | Self::StateMismatch { .. })
    }

    /// True when redelivering the same task cannot succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::StateMismatch { .. }
                | Self::Precondition(_)
                | Self::PermissionDenied(_)
                | Self::AllocationFailed { .. }
                | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for DrydockError {
    fn from(value: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {value}"))
    }
}

impl From<std::io::Error> for DrydockError {
    fn from(value: std::io::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Result alias used throughout the engine.
pub type Result<T, E = DrydockError> = std::result::Result<T, E>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
