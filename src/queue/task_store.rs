//! Per-task status records.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{TaskPatch, TaskRecord, TransitionError};
use crate::storage::{KeySpace, SharedStore, StoreError};

/// Attempts at a compare-and-swap update before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 8;

/// Errors from task record operations.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored record could not be decoded.
    #[error("record for task {task_id} is corrupt: {details}")]
    Corrupt {
        /// Task whose record failed to decode.
        task_id: Uuid,
        /// Decoder message.
        details: String,
    },

    /// The patch asked for a status change the state machine forbids.
    #[error("task {task_id}: {source}")]
    InvalidTransition {
        /// Task being updated.
        task_id: Uuid,
        /// The rejected transition.
        #[source]
        source: TransitionError,
    },

    /// Concurrent writers kept winning the compare-and-swap race.
    #[error("task {task_id} changed concurrently {attempts} times; update abandoned")]
    Conflict {
        /// Task being updated.
        task_id: Uuid,
        /// Attempts made.
        attempts: u32,
    },
}

/// A page of records plus the total number that exist.
#[derive(Debug, Clone, Serialize)]
pub struct TaskList {
    /// Records, newest first.
    pub tasks: Vec<TaskRecord>,
    /// Number of live records before the limit was applied.
    pub total: usize,
}

/// Reads and writes task records at `task:{id}`.
#[derive(Debug, Clone)]
pub struct TaskStore {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    retention: Duration,
}

impl TaskStore {
    /// Creates a task store whose records expire after `retention`.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, retention: Duration) -> Self {
        Self {
            store,
            keys,
            retention,
        }
    }

    /// Writes a new record with the retention expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub async fn create(&self, record: &TaskRecord) -> Result<(), TaskStoreError> {
        let json = serde_json::to_string(record).map_err(StoreError::from)?;
        self.store
            .set_with_expiry(&self.keys.task(&record.task_id), &json, self.retention)
            .await?;
        Ok(())
    }

    /// Returns the record for `task_id`, or `None` if it does not exist (or expired).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record is corrupt.
    pub async fn get(&self, task_id: &Uuid) -> Result<Option<TaskRecord>, TaskStoreError> {
        match self.store.get(&self.keys.task(task_id)).await? {
            Some(raw) => decode(task_id, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Merges `patch` onto the stored record.
    ///
    /// Uses an optimistic read-modify-write: the new value is written only if
    /// the stored JSON is unchanged since it was read, retrying on conflict.
    /// The record's remaining expiry is preserved. A missing record is not an
    /// error and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the patch breaks the status state
    /// machine, `Conflict` if the update kept losing races, or a store error.
    pub async fn update(
        &self,
        task_id: &Uuid,
        patch: &TaskPatch,
    ) -> Result<Option<TaskRecord>, TaskStoreError> {
        let key = self.keys.task(task_id);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(raw) = self.store.get(&key).await? else {
                tracing::debug!(task_id = %task_id, "Update skipped: record not found");
                return Ok(None);
            };
            let mut record = decode(task_id, &raw)?;
            let before = record.clone();
            patch
                .apply(&mut record)
                .map_err(|source| TaskStoreError::InvalidTransition {
                    task_id: *task_id,
                    source,
                })?;
            if record == before {
                return Ok(Some(record));
            }

            let json = serde_json::to_string(&record).map_err(StoreError::from)?;
            if self.store.compare_and_swap(&key, &raw, &json).await? {
                return Ok(Some(record));
            }
            tracing::debug!(task_id = %task_id, attempt, "Record changed during update; retrying");
        }

        Err(TaskStoreError::Conflict {
            task_id: *task_id,
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Deletes the record. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete(&self, task_id: &Uuid) -> Result<bool, TaskStoreError> {
        Ok(self.store.delete(&self.keys.task(task_id)).await?)
    }

    /// Returns every live record. Corrupt records are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn scan(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let prefix = self.keys.task_prefix();
        let keys = self.store.scan_prefix(&prefix).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            // A record may expire or be deleted between the scan and the read.
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<TaskRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping undecodable task record"),
            }
        }
        Ok(records)
    }

    /// Returns the newest `limit` records and the total count.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self, limit: usize) -> Result<TaskList, TaskStoreError> {
        let mut tasks = self.scan().await?;
        sort_newest_first(&mut tasks);
        let total = tasks.len();
        tasks.truncate(limit);
        Ok(TaskList { tasks, total })
    }

    /// Deletes terminal records beyond the newest `keep` records.
    ///
    /// Pending and processing records are never trimmed. Returns the number
    /// of records deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn trim(&self, keep: usize) -> Result<usize, TaskStoreError> {
        let mut tasks = self.scan().await?;
        sort_newest_first(&mut tasks);

        let mut deleted = 0;
        for record in tasks.iter().skip(keep).filter(|r| r.is_terminal()) {
            if self.delete(&record.task_id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, keep, "Trimmed old task records");
        }
        Ok(deleted)
    }
}

fn decode(task_id: &Uuid, raw: &str) -> Result<TaskRecord, TaskStoreError> {
    serde_json::from_str(raw).map_err(|e| TaskStoreError::Corrupt {
        task_id: *task_id,
        details: e.to_string(),
    })
}

fn sort_newest_first(tasks: &mut [TaskRecord]) {
    tasks.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
}
