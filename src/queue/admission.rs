//! Admission: accept or reject new jobs against the depth limit.

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::{Job, StagedInput, TaskPatch, TaskRecord, TaskStatus};

use super::depth::{DepthCounter, Reservation};
use super::error::LaneError;
use super::staging::{is_valid_input_name, ArtifactStager};
use super::task_store::TaskStore;

/// One input artifact supplied with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputArtifact {
    /// Logical name, such as `source` or `template`.
    pub name: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl InputArtifact {
    /// Creates an input artifact.
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// A job as handed to the lane by a front end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Submission {
    /// Input artifacts; at least one is required.
    pub inputs: Vec<InputArtifact>,
    /// Parameters passed through to the operation.
    pub params: Value,
}

impl Submission {
    /// Creates a submission with no parameters.
    #[must_use]
    pub fn new(inputs: Vec<InputArtifact>) -> Self {
        Self {
            inputs,
            params: Value::Null,
        }
    }

    /// Sets the operation parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    fn validate(&self) -> Result<(), LaneError> {
        if self.inputs.is_empty() {
            return Err(LaneError::InvalidSubmission(
                "at least one input is required".to_string(),
            ));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if !is_valid_input_name(&input.name) {
                return Err(LaneError::InvalidSubmission(format!(
                    "invalid input name '{}'",
                    input.name
                )));
            }
            if input.bytes.is_empty() {
                return Err(LaneError::InvalidSubmission(format!(
                    "input '{}' is empty",
                    input.name
                )));
            }
            if self.inputs[..i].iter().any(|other| other.name == input.name) {
                return Err(LaneError::InvalidSubmission(format!(
                    "input '{}' given more than once",
                    input.name
                )));
            }
        }
        Ok(())
    }
}

/// Returned to the submitter when a job is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// The new task's ID.
    pub task_id: Uuid,
    /// Always `pending`.
    pub status: TaskStatus,
    /// Queue depth right after admission, counting this task.
    pub queue_depth_at_submission: u64,
    /// Tasks admitted ahead of this one.
    pub queue_ahead: u64,
}

/// Accepts jobs while the lane has capacity.
///
/// Admission order is: reserve a depth slot, stage inputs, create the
/// `pending` record, enqueue. A failure after the reservation rolls back
/// everything done so far and returns the error.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    tasks: TaskStore,
    depth: DepthCounter,
    queue: super::JobQueue,
    stager: ArtifactStager,
    max_depth: Option<u64>,
    staging_permits: Option<Arc<Semaphore>>,
}

impl AdmissionGate {
    /// Creates a gate.
    ///
    /// `max_depth` of `None` admits without limit. `max_concurrent_staging`
    /// bounds how many submissions stage inputs at once in this process.
    #[must_use]
    pub fn new(
        tasks: TaskStore,
        depth: DepthCounter,
        queue: super::JobQueue,
        stager: ArtifactStager,
        max_depth: Option<u64>,
        max_concurrent_staging: Option<usize>,
    ) -> Self {
        Self {
            tasks,
            depth,
            queue,
            stager,
            max_depth,
            staging_permits: max_concurrent_staging.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// The configured maximum depth.
    #[must_use]
    pub const fn max_depth(&self) -> Option<u64> {
        self.max_depth
    }

    /// Admits a job or rejects it.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` with no side effects when at capacity,
    /// `InvalidSubmission` for unusable input, or the error of whichever
    /// admission step failed (after rolling back).
    pub async fn submit(&self, submission: Submission) -> Result<Accepted, LaneError> {
        submission.validate()?;

        // The semaphore is never closed, so a failed acquire just means no bound.
        let _permit = match &self.staging_permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };

        let task_id = Uuid::new_v4();
        let depth = match self.depth.reserve(&task_id, self.max_depth).await? {
            Reservation::Reserved(depth) => depth,
            Reservation::Full(current) => {
                let max = self.max_depth.unwrap_or(current);
                counter!("gpulane.submissions.rejected").increment(1);
                tracing::info!(current, max, "Submission rejected: queue full");
                return Err(LaneError::QueueFull { current, max });
            }
        };

        match self.admit(task_id, depth, submission).await {
            Ok(accepted) => {
                counter!("gpulane.submissions.accepted").increment(1);
                tracing::info!(
                    task_id = %task_id,
                    queue_depth = depth,
                    queue_ahead = accepted.queue_ahead,
                    "Task submitted"
                );
                Ok(accepted)
            }
            Err(e) => {
                if let Err(release_err) = self.depth.release(&task_id).await {
                    tracing::warn!(
                        task_id = %task_id,
                        error = %release_err,
                        "Failed to return depth slot after aborted submission"
                    );
                }
                tracing::warn!(task_id = %task_id, error = %e, "Submission aborted");
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        task_id: Uuid,
        depth: u64,
        submission: Submission,
    ) -> Result<Accepted, LaneError> {
        let mut staged: Vec<StagedInput> = Vec::with_capacity(submission.inputs.len());
        for input in &submission.inputs {
            match self.stager.stage(&task_id, &input.name, &input.bytes).await {
                Ok(s) => staged.push(s),
                Err(e) => {
                    self.stager.discard(&staged).await;
                    return Err(e.into());
                }
            }
        }

        let record = TaskRecord::pending(task_id, depth, submission.params.clone());
        if let Err(e) = self.tasks.create(&record).await {
            self.stager.discard(&staged).await;
            return Err(e.into());
        }

        let job = Job {
            task_id,
            inputs: staged,
            params: submission.params,
            queue_depth_at_submission: depth,
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            self.stager.discard(&job.inputs).await;
            let patch = TaskPatch::failed("Task could not be queued", e.to_string());
            if let Err(mark_err) = self.tasks.update(&task_id, &patch).await {
                tracing::warn!(task_id = %task_id, error = %mark_err, "Failed to mark unqueued task as failed");
            }
            return Err(e.into());
        }

        Ok(Accepted {
            task_id,
            status: record.status,
            queue_depth_at_submission: record.queue_depth_at_submission,
            queue_ahead: record.queue_ahead,
        })
    }
}
