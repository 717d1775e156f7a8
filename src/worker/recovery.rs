//! Startup recovery of state left behind by a crashed or killed instance.

use serde::Serialize;
use uuid::Uuid;

use crate::models::TaskPatch;
use crate::queue::{Lane, LaneError, TaskStoreError};

/// Message set on tasks failed by recovery.
pub const RESTART_MESSAGE: &str = "Task interrupted by a service restart";

/// Error detail set on tasks failed by recovery.
pub const RESTART_REASON: &str = "Service restarted while the task was queued or running";

/// What [`recover`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Tasks moved from `pending` or `processing` to `failed`.
    pub failed_tasks: Vec<Uuid>,
    /// Whether a lock key was found and removed.
    pub lock_was_held: bool,
    /// Depth counter before the reset, if it was readable.
    pub previous_depth: Option<u64>,
    /// Queue entries discarded.
    pub purged_entries: u64,
    /// Staged input files deleted.
    pub discarded_files: usize,
}

/// Reconciles shared state after a restart.
///
/// Must run before the lane accepts submissions or starts executors, and
/// while no other executor is running: it clears the lock without checking
/// the owner.
///
/// Steps: drop queued entries, fail every `pending` and `processing` task,
/// reset the depth counter to zero and drop its slot markers, remove the
/// lock key, empty the staging
/// directory.
///
/// # Errors
///
/// Returns an error if the store fails. Staging directory problems are
/// logged and do not fail recovery.
pub async fn recover(lane: &Lane) -> Result<RecoveryReport, LaneError> {
    let mut report = RecoveryReport {
        purged_entries: lane.queue().purge().await?,
        ..RecoveryReport::default()
    };

    let patch = TaskPatch::failed(RESTART_MESSAGE, RESTART_REASON);
    for record in lane.tasks().scan().await? {
        if record.is_terminal() {
            continue;
        }
        match lane.tasks().update(&record.task_id, &patch).await {
            Ok(Some(_)) => report.failed_tasks.push(record.task_id),
            Ok(None) => {}
            // Finished between the scan and the update.
            Err(TaskStoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    report.previous_depth = match lane.depth().read().await {
        Ok(depth) => Some(depth),
        Err(e) => {
            tracing::warn!(error = %e, "Queue depth counter was unreadable; resetting");
            None
        }
    };
    let released_slots = lane.depth().reset(0).await?;
    tracing::debug!(released_slots, "Depth slot markers dropped");

    report.lock_was_held = lane.lock().force_clear().await?;

    report.discarded_files = match lane.stager().purge_all().await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(
                dir = %lane.stager().root().display(),
                error = %e,
                "Could not clean the staging directory"
            );
            0
        }
    };

    tracing::info!(
        failed_tasks = report.failed_tasks.len(),
        lock_was_held = report.lock_was_held,
        previous_depth = ?report.previous_depth,
        purged_entries = report.purged_entries,
        discarded_files = report.discarded_files,
        "Recovery complete"
    );
    Ok(report)
}
