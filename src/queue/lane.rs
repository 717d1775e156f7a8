//! The `Lane` facade: one handle over every shared component of the lane.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::LaneConfig;
use crate::lock::{GpuLock, LockSettings};
use crate::models::{TaskRecord, TaskStatus};
use crate::storage::{KeySpace, RedisStore, SharedStore};
use crate::worker::{recover, RecoveryReport};

use super::admission::{Accepted, AdmissionGate, Submission};
use super::depth::{DepthCounter, Reconciled};
use super::error::LaneError;
use super::job_queue::JobQueue;
use super::staging::ArtifactStager;
use super::task_store::{TaskList, TaskStore};

/// A task record plus the live queue depth.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    /// The record.
    #[serde(flatten)]
    pub task: TaskRecord,
    /// Current depth counter, or `None` if it could not be read.
    pub queue_depth: Option<u64>,
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Waiting in the queue.
    pub pending: usize,
    /// Running or waiting for the lock.
    pub processing: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Finished with an error.
    pub failed: usize,
}

impl StatusCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    /// Tasks not yet finished.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.pending + self.processing
    }
}

/// Operational snapshot returned by [`Lane::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    /// Records per status.
    pub counts: StatusCounts,
    /// Total live records.
    pub total: usize,
    /// Depth counter (after reconciliation, if requested).
    pub queue_depth: u64,
    /// Entries waiting in the job list.
    pub queued_entries: u64,
    /// Whether someone holds the exclusive lock.
    pub lock_held: bool,
    /// Configured admission limit.
    pub max_queue_depth: Option<u64>,
    /// Concurrent executions allowed. Always 1.
    pub max_concurrency: u32,
    /// Counter value replaced by reconciliation, when it differed.
    pub reconciled_from: Option<u64>,
}

/// Result of [`Lane::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Whether the store answered a ping.
    pub healthy: bool,
    /// The ping error, if any.
    pub error: Option<String>,
}

/// Entry point for submitters, status readers and operators.
#[derive(Debug, Clone)]
pub struct Lane {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    tasks: TaskStore,
    depth: DepthCounter,
    queue: JobQueue,
    lock: GpuLock,
    stager: ArtifactStager,
    gate: AdmissionGate,
}

impl Lane {
    /// Builds a lane over an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: &LaneConfig) -> Self {
        let keys = KeySpace::new(config.namespace.clone());
        let tasks = TaskStore::new(Arc::clone(&store), keys.clone(), config.tasks.retention());
        let depth = DepthCounter::new(Arc::clone(&store), &keys, config.tasks.retention());
        let queue = JobQueue::new(Arc::clone(&store), &keys);
        let lock = GpuLock::new(
            Arc::clone(&store),
            &keys,
            LockSettings {
                ttl: config.lock.ttl(),
                backoff: config.lock.backoff(),
                notify: config.lock.notify,
                max_wait: config.lock.max_wait(),
            },
        );
        let stager = ArtifactStager::new(config.staging.dir.clone());
        let gate = AdmissionGate::new(
            tasks.clone(),
            depth.clone(),
            queue.clone(),
            stager.clone(),
            config.admission.max_queue_depth,
            config.admission.max_concurrent_staging,
        );

        Self {
            store,
            keys,
            tasks,
            depth,
            queue,
            lock,
            stager,
            gate,
        }
    }

    /// Connects to the Redis at `config.redis_url` and builds a lane on it.
    ///
    /// # Errors
    ///
    /// Returns `LaneError::Store` if the connection cannot be established.
    pub async fn connect(config: &LaneConfig) -> Result<Self, LaneError> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// The key layout in use.
    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Task records.
    #[must_use]
    pub const fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// The depth counter.
    #[must_use]
    pub const fn depth(&self) -> &DepthCounter {
        &self.depth
    }

    /// The job list.
    #[must_use]
    pub const fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The exclusive lock.
    #[must_use]
    pub const fn lock(&self) -> &GpuLock {
        &self.lock
    }

    /// The input staging area.
    #[must_use]
    pub const fn stager(&self) -> &ArtifactStager {
        &self.stager
    }

    /// Admits a job. See [`AdmissionGate::submit`].
    ///
    /// # Errors
    ///
    /// Returns `LaneError::QueueFull` at capacity, or the admission error.
    pub async fn submit(&self, submission: Submission) -> Result<Accepted, LaneError> {
        self.gate.submit(submission).await
    }

    /// Looks up a task.
    ///
    /// # Errors
    ///
    /// Returns `LaneError::NotFound` if no record exists.
    pub async fn status(&self, task_id: &Uuid) -> Result<StatusView, LaneError> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| LaneError::not_found(*task_id))?;

        let queue_depth = match self.depth.read().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::debug!(error = %e, "Could not read queue depth for status");
                None
            }
        };

        Ok(StatusView { task, queue_depth })
    }

    /// Lists up to `limit` records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub async fn list(&self, limit: usize) -> Result<TaskList, LaneError> {
        Ok(self.tasks.list(limit).await?)
    }

    /// Deletes a finished task's record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist, `NotTerminal` if it is still
    /// pending or processing.
    pub async fn delete_task(&self, task_id: &Uuid) -> Result<(), LaneError> {
        let record = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| LaneError::not_found(*task_id))?;
        if !record.is_terminal() {
            return Err(LaneError::NotTerminal {
                task_id: *task_id,
                status: record.status,
            });
        }
        if !self.tasks.delete(task_id).await? {
            return Err(LaneError::not_found(*task_id));
        }
        tracing::info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Deletes terminal records beyond the newest `keep`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub async fn trim(&self, keep: usize) -> Result<usize, LaneError> {
        Ok(self.tasks.trim(keep).await?)
    }

    /// Collects operational counters.
    ///
    /// With `reconcile`, the depth counter is reset to the number of held
    /// depth slots: queued and running jobs plus admissions still in
    /// progress. A corrupt counter is only an error without it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stats(&self, reconcile: bool) -> Result<LaneStats, LaneError> {
        let records = self.tasks.scan().await?;
        let mut counts = StatusCounts::default();
        for record in &records {
            counts.add(record.status);
        }

        let (queue_depth, reconciled_from) = if reconcile {
            let Reconciled { previous, depth } = self.depth.reconcile().await?;
            let changed = previous.filter(|&p| p != depth);
            if let Some(previous) = changed {
                tracing::info!(previous, actual = depth, "Reconciled queue depth counter");
            }
            (depth, changed)
        } else {
            (self.depth.read().await?, None)
        };

        Ok(LaneStats {
            counts,
            total: records.len(),
            queue_depth,
            queued_entries: self.queue.len().await?,
            lock_held: self.lock.is_held().await?,
            max_queue_depth: self.gate.max_depth(),
            max_concurrency: 1,
            reconciled_from,
        })
    }

    /// Pings the store.
    pub async fn health(&self) -> HealthReport {
        match self.store.ping().await {
            Ok(()) => HealthReport {
                healthy: true,
                error: None,
            },
            Err(e) => HealthReport {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Reconciles state left by a previous instance. See [`recover`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails during recovery.
    pub async fn recover(&self) -> Result<RecoveryReport, LaneError> {
        recover(self).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::TaskPatch;
    use crate::queue::InputArtifact;
    use crate::storage::{MemoryStore, SharedStore};

    fn lane(dir: &tempfile::TempDir, max: Option<u64>) -> (MemoryStore, Lane) {
        let store = MemoryStore::new();
        let mut config = LaneConfig::default();
        config.staging.dir = dir.path().to_path_buf();
        config.admission.max_queue_depth = max;
        let lane = Lane::new(Arc::new(store.clone()), &config);
        (store, lane)
    }

    fn submission() -> Submission {
        Submission::new(vec![InputArtifact::new("source", b"x".to_vec())])
    }

    #[tokio::test]
    async fn test_status_includes_depth() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, None);
        let accepted = lane.submit(submission()).await.unwrap();

        let view = lane.status(&accepted.task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Pending);
        assert_eq!(view.queue_depth, Some(1));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["queue_depth"], 1);
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, None);
        let err = lane.status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LaneError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_status_survives_garbage_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (store, lane) = lane(&dir, None);
        let accepted = lane.submit(submission()).await.unwrap();
        store.set("queue_size", "garbage").await.unwrap();

        let view = lane.status(&accepted.task_id).await.unwrap();
        assert_eq!(view.queue_depth, None);
    }

    #[tokio::test]
    async fn test_delete_requires_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, None);
        let id = lane.submit(submission()).await.unwrap().task_id;

        let err = lane.delete_task(&id).await.unwrap_err();
        assert!(matches!(
            err,
            LaneError::NotTerminal {
                status: TaskStatus::Pending,
                ..
            }
        ));

        lane.tasks()
            .update(&id, &TaskPatch::failed("Failed", "boom"))
            .await
            .unwrap();
        lane.delete_task(&id).await.unwrap();
        assert!(matches!(
            lane.delete_task(&id).await,
            Err(LaneError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stats_and_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let (store, lane) = lane(&dir, Some(3));
        let first = lane.submit(submission()).await.unwrap().task_id;
        lane.submit(submission()).await.unwrap();
        lane.tasks()
            .update(&first, &TaskPatch::processing("exec-1"))
            .await
            .unwrap();

        let stats = lane.stats(false).await.unwrap();
        assert_eq!(stats.counts.pending, 1);
        assert_eq!(stats.counts.processing, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.queued_entries, 2);
        assert!(!stats.lock_held);
        assert_eq!(stats.max_queue_depth, Some(3));
        assert_eq!(stats.max_concurrency, 1);

        // Drift the counter, then reconcile it back.
        store.set("queue_size", "7").await.unwrap();
        assert_eq!(stats.counts.active(), 2);
        let stats = lane.stats(true).await.unwrap();
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.reconciled_from, Some(7));
        assert_eq!(lane.depth().read().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_garbage_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (store, lane) = lane(&dir, None);
        store.set("queue_size", "garbage").await.unwrap();

        assert!(lane.stats(false).await.is_err());
        let stats = lane.stats(true).await.unwrap();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.reconciled_from, None);
    }

    #[tokio::test]
    async fn test_reconcile_counts_admission_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, Some(2));
        // A submitter holds a slot and is still staging its inputs.
        lane.depth().reserve(&Uuid::new_v4(), Some(2)).await.unwrap();

        let stats = lane.stats(true).await.unwrap();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.reconciled_from, None);

        lane.submit(submission()).await.unwrap();
        let err = lane.submit(submission()).await.unwrap_err();
        assert!(matches!(err, LaneError::QueueFull { current: 2, max: 2 }));
    }

    #[tokio::test]
    async fn test_reconcile_counts_finished_job_not_yet_released() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, Some(2));
        let first = lane.submit(submission()).await.unwrap().task_id;
        lane.submit(submission()).await.unwrap();
        // Recorded as completed, but the executor has not decremented yet.
        lane.tasks()
            .update(&first, &TaskPatch::processing("exec-1"))
            .await
            .unwrap();
        lane.tasks()
            .update(&first, &TaskPatch::completed(None, None))
            .await
            .unwrap();

        assert_eq!(lane.stats(true).await.unwrap().queue_depth, 2);
        assert_eq!(lane.depth().release(&first).await.unwrap(), 1);
        assert_eq!(lane.stats(true).await.unwrap().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_trim_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, None);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(lane.submit(submission()).await.unwrap().task_id);
        }
        for id in &ids[..2] {
            lane.tasks()
                .update(id, &TaskPatch::failed("Failed", "x"))
                .await
                .unwrap();
        }

        assert_eq!(lane.trim(0).await.unwrap(), 2);
        let remaining = lane.list(10).await.unwrap();
        assert_eq!(remaining.total, 1);
        assert_eq!(remaining.tasks[0].task_id, ids[2]);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (_, lane) = lane(&dir, None);
        let report = lane.health().await;
        assert!(report.healthy);
        assert!(report.error.is_none());
    }
}
