//! The exclusive operation trait and the context it runs with.
//!
//! An [`ExclusiveOperation`] is the long-running work that needs the GPU.
//! The executor calls it only while holding the exclusive lock, hands it the
//! job's inputs already loaded, and turns its milestone reports into
//! progress updates on the task record.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{Milestone, TaskPatch};
use crate::queue::TaskStore;

/// Errors an operation can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The inputs or parameters were unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation exceeded its time limit.
    #[error("operation timed out after {0} seconds")]
    TimedOut(u64),

    /// The operation panicked.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

/// What a successful operation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutput {
    /// Where the result artifact was written, if anywhere.
    pub result_ref: Option<String>,
    /// Extra details stored on the task record.
    pub details: Option<Value>,
}

impl OperationOutput {
    /// An output with only a result reference.
    #[must_use]
    pub fn with_ref(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: Some(result_ref.into()),
            details: None,
        }
    }
}

/// One staged input, read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedInput {
    /// Logical name.
    pub name: String,
    /// Staged path, for operations that prefer to open the file themselves.
    pub path: PathBuf,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Reports milestones for one task.
///
/// Updates are best-effort: a store failure is logged and the operation
/// carries on.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    tasks: Option<TaskStore>,
}

impl ProgressReporter {
    /// A reporter writing to `task_id`'s record.
    #[must_use]
    pub const fn new(task_id: Uuid, tasks: TaskStore) -> Self {
        Self {
            task_id,
            tasks: Some(tasks),
        }
    }

    /// A reporter that discards every update, for unqueued runs.
    #[must_use]
    pub const fn detached() -> Self {
        Self {
            task_id: Uuid::nil(),
            tasks: None,
        }
    }

    /// Records that `milestone` was reached.
    pub async fn report(&self, milestone: Milestone) {
        let Some(tasks) = &self.tasks else {
            return;
        };
        match tasks
            .update(&self.task_id, &TaskPatch::milestone(milestone))
            .await
        {
            Ok(_) => {
                tracing::debug!(task_id = %self.task_id, progress = milestone.percent(), "Progress updated");
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "Failed to record progress");
            }
        }
    }
}

/// Asks a running operation to stop.
///
/// The executor keeps the exclusive lock until the operation has actually
/// returned, so an operation that owns work outside its own future (a child
/// process, a blocking thread) should watch [`Cancellation`] and wind that
/// work down.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation. Repeated calls are harmless.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// The operation's side of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A connected handle and signal.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::pair().1
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested; never completes if the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything an operation gets for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The task, or the nil UUID for unqueued runs.
    pub task_id: Uuid,
    /// Inputs in submission order.
    pub inputs: Vec<LoadedInput>,
    /// Caller-supplied parameters.
    pub params: Value,
    /// Milestone sink.
    pub progress: ProgressReporter,
    /// Fires when the executor wants the operation to stop early.
    pub cancel: Cancellation,
}

impl JobContext {
    /// Finds an input by name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&LoadedInput> {
        self.inputs.iter().find(|input| input.name == name)
    }
}

/// Work that must run with exclusive use of the GPU.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use gpulane::models::Milestone;
/// use gpulane::worker::{ExclusiveOperation, JobContext, OperationError, OperationOutput};
///
/// struct FaceSwap;
///
/// #[async_trait]
/// impl ExclusiveOperation for FaceSwap {
///     async fn run(&self, ctx: &JobContext) -> Result<OperationOutput, OperationError> {
///         ctx.progress.report(Milestone::DetectionDone).await;
///         // ...
///         Ok(OperationOutput::with_ref("results/out.jpg"))
///     }
/// }
/// ```
#[async_trait]
pub trait ExclusiveOperation: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "operation"
    }

    /// One-time preparation before the first job, such as loading a model.
    ///
    /// # Errors
    ///
    /// A failure is logged by the runner and is not fatal.
    async fn warm_up(&self) -> Result<(), OperationError> {
        Ok(())
    }

    /// Runs the operation for one job.
    ///
    /// # Errors
    ///
    /// Any error is recorded on the task as a failure.
    async fn run(&self, ctx: &JobContext) -> Result<OperationOutput, OperationError>;
}

impl std::fmt::Debug for dyn ExclusiveOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExclusiveOperation({})", self.name())
    }
}
