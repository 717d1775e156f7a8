use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Represents the status of a task in the lane.
///
/// Tasks progress through states: `Pending` -> `Processing` -> `Completed`/`Failed`.
/// A pending task may also fail directly (unreadable inputs, restart recovery).
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued and waiting for the exclusive resource.
    #[default]
    Pending,
    /// Task has been dequeued by an executor.
    Processing,
    /// Task finished successfully.
    Completed,
    /// Task failed; the record carries the error.
    Failed,
}

impl TaskStatus {
    /// All status variants, in lifecycle order.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Display name for humans.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a record in this status may move to `next`.
    ///
    /// Re-asserting the current non-terminal status is allowed so that
    /// progress-only patches can carry the status along.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Processing | Self::Failed)
                | (Self::Processing, Self::Processing | Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// Coarse progress points reported while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    /// Accepted and waiting (0).
    Accepted,
    /// Execution context (model) is ready (10).
    ContextReady,
    /// Input analysis finished (30).
    DetectionDone,
    /// The main transformation is running (50).
    Transforming,
    /// The result artifact is being written (90).
    Materializing,
    /// Finished (100).
    Done,
}

impl Milestone {
    /// Progress percentage for this milestone.
    #[must_use]
    pub const fn percent(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::ContextReady => 10,
            Self::DetectionDone => 30,
            Self::Transforming => 50,
            Self::Materializing => 90,
            Self::Done => 100,
        }
    }

    /// Status message shown to callers while at this milestone.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Accepted => "Task submitted, waiting to be processed",
            Self::ContextReady => "Initializing model",
            Self::DetectionDone => "Analyzing input",
            Self::Transforming => "Processing",
            Self::Materializing => "Generating result",
            Self::Done => "Completed",
        }
    }

    /// Parses a milestone from its snake_case name or its percentage.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [Milestone; 6] = [
            Milestone::Accepted,
            Milestone::ContextReady,
            Milestone::DetectionDone,
            Milestone::Transforming,
            Milestone::Materializing,
            Milestone::Done,
        ];
        let s = s.trim();
        if let Ok(percent) = s.parse::<u8>() {
            return ALL.into_iter().find(|m| m.percent() == percent);
        }
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// A status transition the record state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct TransitionError {
    /// Status stored on the record.
    pub from: TaskStatus,
    /// Status the patch asked for.
    pub to: TaskStatus,
}

/// The status record of one submitted task, stored as JSON at `task:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier, generated at submission.
    pub task_id: Uuid,

    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Progress percentage (0-100), non-decreasing.
    #[serde(default)]
    pub progress: u8,

    /// Human-readable status message.
    #[serde(default)]
    pub message: String,

    /// When the task was submitted.
    pub created_at: DateTime<Utc>,

    /// When an executor picked the task up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Reference to the result artifact (a path or URL), set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,

    /// Extra result details supplied by the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error detail, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Queue depth observed right after this task was admitted.
    #[serde(default)]
    pub queue_depth_at_submission: u64,

    /// Number of tasks admitted ahead of this one.
    #[serde(default)]
    pub queue_ahead: u64,

    /// Queue depth right after this task finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_remaining: Option<u64>,

    /// Executor that processed the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,

    /// Operation parameters, echoed for observability.
    #[serde(default)]
    pub params: Value,
}

impl TaskRecord {
    /// Creates a fresh `pending` record for a just-admitted task.
    #[must_use]
    pub fn pending(task_id: Uuid, queue_depth: u64, params: Value) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            progress: Milestone::Accepted.percent(),
            message: Milestone::Accepted.message().to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result_ref: None,
            result: None,
            error: None,
            queue_depth_at_submission: queue_depth,
            queue_ahead: queue_depth.saturating_sub(1),
            queue_remaining: None,
            executor_id: None,
            params,
        }
    }

    /// Returns true if the record is `completed` or `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns when the task reached its terminal state, if it has.
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }
}

/// A partial update merged onto a stored [`TaskRecord`].
///
/// Only fields that are `Some` are written. Build one with the constructors
/// for the common transitions or field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// New status.
    pub status: Option<TaskStatus>,
    /// New progress; ignored if lower than the stored value.
    pub progress: Option<u8>,
    /// New message.
    pub message: Option<String>,
    /// Start timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure timestamp.
    pub failed_at: Option<DateTime<Utc>>,
    /// Result artifact reference.
    pub result_ref: Option<String>,
    /// Result details.
    pub result: Option<Value>,
    /// Error detail.
    pub error: Option<String>,
    /// Queue depth after the task finished.
    pub queue_remaining: Option<u64>,
    /// Executor id.
    pub executor_id: Option<String>,
}

impl TaskPatch {
    /// `pending -> processing` at the first running milestone.
    #[must_use]
    pub fn processing(executor_id: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Processing),
            progress: Some(Milestone::ContextReady.percent()),
            message: Some(Milestone::ContextReady.message().to_string()),
            started_at: Some(Utc::now()),
            executor_id: Some(executor_id.into()),
            ..Self::default()
        }
    }

    /// Progress update within `processing`.
    #[must_use]
    pub fn milestone(milestone: Milestone) -> Self {
        Self {
            progress: Some(milestone.percent()),
            message: Some(milestone.message().to_string()),
            ..Self::default()
        }
    }

    /// Successful completion.
    #[must_use]
    pub fn completed(result_ref: Option<String>, result: Option<Value>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(Milestone::Done.percent()),
            message: Some(Milestone::Done.message().to_string()),
            completed_at: Some(Utc::now()),
            result_ref,
            result,
            ..Self::default()
        }
    }

    /// Failure with an error detail; progress is left where it was.
    #[must_use]
    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            message: Some(message.into()),
            error: Some(error.into()),
            failed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Records the queue depth left after the task finished.
    #[must_use]
    pub fn queue_remaining(depth: u64) -> Self {
        Self {
            queue_remaining: Some(depth),
            ..Self::default()
        }
    }

    /// Merges this patch onto `record`.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` if the patch moves the status in a way the
    /// state machine forbids. `record` is left untouched in that case.
    pub fn apply(&self, record: &mut TaskRecord) -> Result<(), TransitionError> {
        let next = self.status.unwrap_or(record.status);
        let illegal = if record.status.is_terminal() {
            // A finished task only accepts bookkeeping.
            next != record.status || !self.is_bookkeeping()
        } else {
            !record.status.can_transition_to(next)
        };
        if illegal {
            return Err(TransitionError {
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        if let Some(progress) = self.progress {
            record.progress = record.progress.max(progress.min(100));
        }
        if let Some(message) = &self.message {
            record.message.clone_from(message);
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            record.completed_at = self.completed_at;
        }
        if self.failed_at.is_some() {
            record.failed_at = self.failed_at;
        }
        if self.result_ref.is_some() {
            record.result_ref.clone_from(&self.result_ref);
        }
        if self.result.is_some() {
            record.result.clone_from(&self.result);
        }
        if self.error.is_some() {
            record.error.clone_from(&self.error);
        }
        if self.queue_remaining.is_some() {
            record.queue_remaining = self.queue_remaining;
        }
        if self.executor_id.is_some() {
            record.executor_id.clone_from(&self.executor_id);
        }
        Ok(())
    }

    /// True if the patch touches nothing but post-run bookkeeping.
    fn is_bookkeeping(&self) -> bool {
        let Self {
            status: _,
            queue_remaining: _,
            progress,
            message,
            started_at,
            completed_at,
            failed_at,
            result_ref,
            result,
            error,
            executor_id,
        } = self;
        progress.is_none()
            && message.is_none()
            && started_at.is_none()
            && completed_at.is_none()
            && failed_at.is_none()
            && result_ref.is_none()
            && result.is_none()
            && error.is_none()
            && executor_id.is_none()
    }
}
