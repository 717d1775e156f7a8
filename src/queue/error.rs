//! Rich error types for lane operations.
//!
//! These error types provide context-aware error messages with helpful
//! suggestions for resolving common issues.

use thiserror::Error;
use uuid::Uuid;

use crate::lock::LockError;
use crate::models::TaskStatus;
use crate::storage::StoreError;
use crate::worker::OperationError;

use super::task_store::TaskStoreError;

/// Errors returned by the [`Lane`](super::Lane) facade and the executor.
#[derive(Debug, Error)]
pub enum LaneError {
    /// Admission refused: the lane already holds its maximum number of tasks.
    #[error("Queue is full ({current} of {max} slots in use)")]
    QueueFull {
        /// Depth observed at the rejection.
        current: u64,
        /// Configured maximum depth.
        max: u64,
    },

    /// No record exists for the task (never submitted, deleted, or expired).
    #[error("Task not found: {task_id}")]
    NotFound {
        /// The ID that was looked up.
        task_id: Uuid,
    },

    /// The task is still queued or running and cannot be deleted.
    #[error("Task {task_id} is still {status}")]
    NotTerminal {
        /// The task.
        task_id: Uuid,
        /// Its current status.
        status: TaskStatus,
    },

    /// The submission itself is unusable.
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// Staged inputs could not be written or read.
    #[error("Input staging failed: {0}")]
    Staging(#[from] std::io::Error),

    /// A store error occurred.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A task record operation failed.
    #[error("{0}")]
    TaskStore(#[from] TaskStoreError),

    /// The exclusive lock could not be obtained or released.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// The exclusive operation failed (unqueued runs only; queued failures are
    /// recorded on the task instead).
    #[error("{0}")]
    Operation(#[from] OperationError),
}

impl LaneError {
    /// Returns a helpful suggestion for resolving this error.
    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => {
                "The lane is at capacity. Retry after running tasks finish, or raise \
                 admission.max_queue_depth (GPULANE_MAX_QUEUE_DEPTH). If no workers are \
                 running, the counter may be stale: run `gpulane stats --reconcile`."
            }
            Self::NotFound { .. } => {
                "Task records expire after tasks.retention_hours (48 hours by default) and \
                 may have been trimmed. Check the ID with `gpulane list`."
            }
            Self::NotTerminal { .. } => {
                "Running tasks cannot be cancelled. Wait for the task to complete or fail, \
                 then delete it."
            }
            Self::InvalidSubmission(_) => {
                "Provide at least one non-empty input. Input names may contain only \
                 letters, digits, '-' and '_'."
            }
            Self::Staging(_) => {
                "Check that staging.dir (GPULANE_STAGING_DIR) exists, is writable, and is \
                 shared with the worker hosts."
            }
            Self::Store(err) => err.suggestion(),
            Self::TaskStore(TaskStoreError::Store(err)) => err.suggestion(),
            Self::TaskStore(TaskStoreError::Conflict { .. }) => {
                "The record was being updated concurrently. Retry the operation."
            }
            Self::TaskStore(_) => {
                "The task record is not in the expected shape. Another program may be \
                 writing to gpulane keys; consider a dedicated namespace."
            }
            Self::Lock(LockError::Store(err)) => err.suggestion(),
            Self::Lock(LockError::WaitTimeout { .. }) => {
                "Another process held the exclusive lock for the whole wait. Raise \
                 lock.max_wait_secs, or check `gpulane stats` for a stuck holder."
            }
            Self::Operation(_) => {
                "The operation itself failed. Check the worker logs and the operation's \
                 own error output."
            }
        }
    }

    /// Returns a richly formatted error message with context and suggestions.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {self}\n\nSuggestion:\n  {}", self.suggestion())
    }

    /// Creates a `NotFound` error from a task ID.
    #[must_use]
    pub const fn not_found(task_id: Uuid) -> Self {
        Self::NotFound { task_id }
    }
}

/// Trait for errors that support rich display with suggestions.
pub trait RichError: std::error::Error {
    /// Returns a helpful suggestion for resolving this error.
    fn suggestion(&self) -> &'static str;

    /// Returns a richly formatted error message with context and suggestions.
    fn display_rich(&self) -> String;
}

impl RichError for StoreError {
    fn suggestion(&self) -> &'static str {
        Self::suggestion(self)
    }

    fn display_rich(&self) -> String {
        Self::display_rich(self)
    }
}

impl RichError for LaneError {
    fn suggestion(&self) -> &'static str {
        Self::suggestion(self)
    }

    fn display_rich(&self) -> String {
        Self::display_rich(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_message() {
        let err = LaneError::QueueFull { current: 3, max: 3 };
        assert_eq!(err.to_string(), "Queue is full (3 of 3 slots in use)");
        assert!(err.display_rich().contains("--reconcile"));
    }

    #[test]
    fn test_store_suggestion_passes_through() {
        let err = LaneError::from(StoreError::ConnectionError("refused".into()));
        assert!(err.suggestion().contains("REDIS_URL"));
    }

    #[test]
    fn test_not_terminal_message() {
        let id = Uuid::nil();
        let err = LaneError::NotTerminal {
            task_id: id,
            status: TaskStatus::Processing,
        };
        assert_eq!(err.to_string(), format!("Task {id} is still processing"));
    }
}
