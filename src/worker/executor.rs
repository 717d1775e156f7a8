//! Executes queued jobs one at a time under the exclusive lock.
//!
//! Per job the executor moves through: dequeued, waiting for the lock,
//! running, recording the outcome, cleanup. Failures of the operation, of
//! input loading and of the lock are all recorded on the task as `failed`;
//! nothing escapes [`Executor::process`].
//!
//! An operation that overruns its time limit is asked to stop and counts as
//! failed, but the lock is held until it has actually returned.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::WorkerSection;
use crate::lock::{GpuLock, LockGuard};
use crate::models::{Job, TaskPatch, TaskStatus};
use crate::queue::{ArtifactStager, DepthCounter, Dequeued, JobQueue, Lane, LaneError, TaskStore};

use super::handler::{
    CancelHandle, Cancellation, ExclusiveOperation, JobContext, LoadedInput, OperationError,
    OperationOutput, ProgressReporter,
};

/// Message stored on a task whose operation failed.
const FAILED_MESSAGE: &str = "Processing failed";

/// Per-executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Identifier written to the records this executor runs.
    pub executor_id: String,
    /// How long one dequeue blocks.
    pub dequeue_timeout: Duration,
    /// Fail operations running longer than this. The lock stays held until
    /// the operation returns.
    pub operation_timeout: Option<Duration>,
}

impl ExecutorSettings {
    /// Settings from the `[worker]` section with a generated ID.
    #[must_use]
    pub fn from_config(worker: &WorkerSection) -> Self {
        Self {
            executor_id: generate_executor_id(),
            dequeue_timeout: worker.dequeue_timeout(),
            operation_timeout: worker.operation_timeout(),
        }
    }

    /// Replaces the executor ID.
    #[must_use]
    pub fn with_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&WorkerSection::default())
    }
}

/// Generates an executor ID like `executor-1a2b3c4d`.
#[must_use]
pub fn generate_executor_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("executor-{}", &id[..8])
}

/// Why an entry was dropped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The task record no longer exists.
    Missing,
    /// The task had already finished (for example, failed by recovery).
    AlreadyFinished(TaskStatus),
}

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The operation succeeded.
    Completed {
        /// The task.
        task_id: Uuid,
        /// The operation's result reference.
        result_ref: Option<String>,
    },
    /// The job failed; the error is recorded on the task.
    Failed {
        /// The task.
        task_id: Uuid,
        /// The recorded error.
        error: String,
    },
    /// The entry was dropped without running.
    Skipped {
        /// The task.
        task_id: Uuid,
        /// Why.
        reason: SkipReason,
    },
}

impl JobOutcome {
    /// The task this outcome belongs to.
    #[must_use]
    pub const fn task_id(&self) -> Uuid {
        match self {
            Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Skipped { task_id, .. } => *task_id,
        }
    }
}

/// Runs jobs from the lane's queue.
///
/// Many executors (in one process or many) may share a lane; the exclusive
/// lock keeps at most one operation running at a time.
#[derive(Debug, Clone)]
pub struct Executor {
    tasks: TaskStore,
    depth: DepthCounter,
    queue: JobQueue,
    lock: GpuLock,
    stager: ArtifactStager,
    operation: Arc<dyn ExclusiveOperation>,
    settings: ExecutorSettings,
}

impl Executor {
    /// Creates an executor over `lane`'s components.
    #[must_use]
    pub fn new(
        lane: &Lane,
        operation: Arc<dyn ExclusiveOperation>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            tasks: lane.tasks().clone(),
            depth: lane.depth().clone(),
            queue: lane.queue().clone(),
            lock: lane.lock().clone(),
            stager: lane.stager().clone(),
            operation,
            settings,
        }
    }

    /// This executor's ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.settings.executor_id
    }

    /// The operation this executor runs.
    #[must_use]
    pub fn operation(&self) -> &Arc<dyn ExclusiveOperation> {
        &self.operation
    }

    /// Dequeues and processes at most one job.
    ///
    /// Returns `None` if the queue stayed empty for the dequeue timeout or
    /// the entry taken could not be decoded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the dequeue itself fails.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>, LaneError> {
        match self.queue.dequeue(self.settings.dequeue_timeout).await? {
            None => Ok(None),
            Some(Dequeued::Job(job)) => Ok(Some(self.process(job).await)),
            Some(Dequeued::Undecodable { task_id }) => {
                self.release_undecodable(task_id).await;
                Ok(None)
            }
        }
    }

    /// Processes one dequeued job to a terminal state.
    pub async fn process(&self, job: Job) -> JobOutcome {
        let task_id = job.task_id;

        match self.tasks.get(&task_id).await {
            Ok(None) => return self.skip(&job, SkipReason::Missing).await,
            Ok(Some(record)) if record.is_terminal() => {
                return self
                    .skip(&job, SkipReason::AlreadyFinished(record.status))
                    .await;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Could not read task record; processing anyway");
            }
        }

        let started = Instant::now();
        self.patch(&task_id, &TaskPatch::processing(self.id())).await;
        tracing::info!(task_id = %task_id, executor_id = %self.id(), "Task started");

        let outcome = match self.load_inputs(&job).await {
            Ok(inputs) => self.execute(&job, inputs).await,
            Err(e) => Err(format!("Failed to read staged input: {e}")),
        };

        let outcome = match outcome {
            Ok(output) => {
                self.patch(
                    &task_id,
                    &TaskPatch::completed(output.result_ref.clone(), output.details),
                )
                .await;
                counter!("gpulane.tasks.completed").increment(1);
                tracing::info!(
                    task_id = %task_id,
                    duration = ?started.elapsed(),
                    result_ref = output.result_ref.as_deref().unwrap_or(""),
                    "Task completed"
                );
                JobOutcome::Completed {
                    task_id,
                    result_ref: output.result_ref,
                }
            }
            Err(error) => {
                self.patch(&task_id, &TaskPatch::failed(FAILED_MESSAGE, error.clone()))
                    .await;
                counter!("gpulane.tasks.failed").increment(1);
                tracing::error!(task_id = %task_id, error = %error, "Task failed");
                JobOutcome::Failed { task_id, error }
            }
        };
        histogram!("gpulane.task.duration_seconds").record(started.elapsed().as_secs_f64());

        self.finish(&job).await;
        outcome
    }

    /// Runs the operation directly under the lock, without a task record or
    /// a depth slot.
    ///
    /// # Errors
    ///
    /// Returns `LaneError::Lock` if the lock cannot be obtained, or
    /// `LaneError::Operation` if the operation fails.
    pub async fn run_unqueued(
        &self,
        inputs: Vec<LoadedInput>,
        params: Value,
    ) -> Result<OperationOutput, LaneError> {
        let (cancel, signal) = Cancellation::pair();
        let ctx = JobContext {
            task_id: Uuid::nil(),
            inputs,
            params,
            progress: ProgressReporter::detached(),
            cancel: signal,
        };
        let guard = self.lock.acquire().await?;
        let result = self.run_operation(&ctx, &cancel).await;
        release(guard, &ctx.task_id).await;
        Ok(result?)
    }

    /// Holds the lock around one operation run. Returns the error text on failure.
    async fn execute(&self, job: &Job, inputs: Vec<LoadedInput>) -> Result<OperationOutput, String> {
        let (cancel, signal) = Cancellation::pair();
        let ctx = JobContext {
            task_id: job.task_id,
            inputs,
            params: job.params.clone(),
            progress: ProgressReporter::new(job.task_id, self.tasks.clone()),
            cancel: signal,
        };

        let guard = self
            .lock
            .acquire()
            .await
            .map_err(|e| format!("Could not obtain the GPU lock: {e}"))?;
        tracing::debug!(task_id = %job.task_id, "Lock acquired; running operation");

        let result = self.run_operation(&ctx, &cancel).await;
        release(guard, &job.task_id).await;
        result.map_err(|e| e.to_string())
    }

    /// Runs the operation to completion. Must be called with the lock held.
    ///
    /// On timeout the operation is cancelled and then awaited, so it has
    /// stopped by the time this returns.
    async fn run_operation(
        &self,
        ctx: &JobContext,
        cancel: &CancelHandle,
    ) -> Result<OperationOutput, OperationError> {
        let mut run = std::pin::pin!(AssertUnwindSafe(self.operation.run(ctx)).catch_unwind());
        let caught = match self.settings.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, run.as_mut()).await {
                Ok(caught) => caught,
                Err(_) => {
                    tracing::warn!(
                        task_id = %ctx.task_id,
                        limit = ?limit,
                        "Operation timed out; waiting for it to stop before releasing the lock"
                    );
                    cancel.cancel();
                    if let Err(panic) = run.await {
                        tracing::warn!(
                            task_id = %ctx.task_id,
                            panic = %panic_message(&*panic),
                            "Timed-out operation panicked while stopping"
                        );
                    }
                    return Err(OperationError::TimedOut(limit.as_secs()));
                }
            },
            None => run.await,
        };
        caught.unwrap_or_else(|panic| Err(OperationError::Panicked(panic_message(&*panic))))
    }

    async fn load_inputs(&self, job: &Job) -> std::io::Result<Vec<LoadedInput>> {
        let mut inputs = Vec::with_capacity(job.inputs.len());
        for staged in &job.inputs {
            let bytes = self.stager.load(staged).await?;
            inputs.push(LoadedInput {
                name: staged.name.clone(),
                path: staged.path.clone(),
                bytes,
            });
        }
        Ok(inputs)
    }

    async fn skip(&self, job: &Job, reason: SkipReason) -> JobOutcome {
        tracing::debug!(task_id = %job.task_id, reason = ?reason, "Skipping queue entry");
        // Recovery drops slot markers along with the counter, so a marker
        // still present means this entry's slot was never given back.
        match self.depth.release_if_held(&job.task_id).await {
            Ok(Some(remaining)) => {
                tracing::debug!(task_id = %job.task_id, remaining, "Released slot of skipped entry");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(task_id = %job.task_id, error = %e, "Failed to release depth slot of skipped entry");
            }
        }
        self.stager.discard(&job.inputs).await;
        JobOutcome::Skipped {
            task_id: job.task_id,
            reason,
        }
    }

    /// Gives back the depth slot, notes the remaining depth and deletes inputs.
    async fn finish(&self, job: &Job) {
        match self.depth.release(&job.task_id).await {
            Ok(remaining) => {
                self.patch(&job.task_id, &TaskPatch::queue_remaining(remaining))
                    .await;
            }
            Err(e) => {
                tracing::warn!(task_id = %job.task_id, error = %e, "Failed to decrement queue depth");
            }
        }
        self.stager.discard(&job.inputs).await;
    }

    /// Gives back the slot of an entry that could not be decoded.
    async fn release_undecodable(&self, task_id: Option<Uuid>) {
        let released = match task_id {
            Some(task_id) => self.depth.release(&task_id).await,
            None => self.depth.release_unmarked().await,
        };
        if let Err(e) = released {
            tracing::warn!(task_id = ?task_id, error = %e, "Failed to release depth slot of undecodable entry");
        }
    }

    /// Best-effort record update.
    async fn patch(&self, task_id: &Uuid, patch: &TaskPatch) {
        match self.tasks.update(task_id, patch).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(task_id = %task_id, "Task record disappeared during processing");
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to update task record");
            }
        }
    }
}

async fn release(guard: LockGuard, task_id: &Uuid) {
    if let Err(e) = guard.release().await {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to release exclusive lock; it will expire");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
