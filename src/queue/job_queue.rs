//! FIFO transport of accepted jobs from submitters to executors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::models::Job;
use crate::storage::{KeySpace, SharedStore, StoreError};

/// One entry taken off the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    /// A well-formed job.
    Job(Job),
    /// An entry that did not decode. It has been removed; its depth slot
    /// is still held and belongs to `task_id` when that could be read.
    Undecodable {
        /// The owning task, if the payload still names one.
        task_id: Option<Uuid>,
    },
}

impl Dequeued {
    /// The job, if the entry decoded.
    #[must_use]
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Job(job) => Some(job),
            Self::Undecodable { .. } => None,
        }
    }
}

/// The `task_queue` list. Producers push to the tail, executors pop the head.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn SharedStore>,
    key: String,
}

impl JobQueue {
    /// Creates a handle on the key space's job list.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, keys: &KeySpace) -> Self {
        Self {
            store,
            key: keys.task_queue(),
        }
    }

    /// Appends a job. Returns the queue length after the push.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be encoded or pushed.
    pub async fn enqueue(&self, job: &Job) -> Result<u64, StoreError> {
        let payload = serde_json::to_string(job)?;
        self.store.push_back(&self.key, &payload).await
    }

    /// Takes the oldest entry, waiting up to `timeout` for one.
    ///
    /// Each entry is delivered to exactly one caller. Returns `None` on
    /// timeout. An entry that cannot be decoded is logged and returned as
    /// [`Dequeued::Undecodable`] so the caller can give back its slot.
    ///
    /// # Errors
    ///
    /// Returns a store error if the pop fails.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Dequeued>, StoreError> {
        let Some(payload) = self.store.pop_front_blocking(&self.key, timeout).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Job>(&payload) {
            Ok(job) => Ok(Some(Dequeued::Job(job))),
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Dropping undecodable queue entry");
                Ok(Some(Dequeued::Undecodable {
                    task_id: salvage_task_id(&payload),
                }))
            }
        }
    }

    /// Number of jobs waiting.
    ///
    /// # Errors
    ///
    /// Returns a store error if the length cannot be read.
    pub async fn len(&self) -> Result<u64, StoreError> {
        self.store.list_len(&self.key).await
    }

    /// Returns true if no jobs are waiting.
    ///
    /// # Errors
    ///
    /// Returns a store error if the length cannot be read.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Drops every waiting job. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the purge fails.
    pub async fn purge(&self) -> Result<u64, StoreError> {
        self.store.purge_list(&self.key).await
    }
}

fn salvage_task_id(payload: &str) -> Option<Uuid> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("task_id")?.as_str()?.parse().ok()
}
