//! The shared store protocol.
//!
//! Every piece of shared mutable state (task records, the depth counter, the
//! lock key and the job list) lives behind this trait. Each method is a single
//! atomic operation on the backing store; callers never compose separate
//! reads and writes to mutate shared state.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::error::StoreError;

/// Stream of messages published on a channel.
pub type Notifications = BoxStream<'static, String>;

/// Outcome of [`SharedStore::incr_below`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedIncr {
    /// The counter was below the limit and now holds this value.
    Incremented(i64),
    /// The counter was at or above the limit and was left untouched.
    AtLimit(i64),
}

/// Key-value, counter, list and pub/sub primitives with the atomicity the
/// lane depends on.
///
/// [`RedisStore`](super::RedisStore) is the production implementation;
/// [`MemoryStore`](super::MemoryStore) is a single-process stand-in with the
/// same semantics.
#[async_trait]
pub trait SharedStore: Send + Sync + Debug {
    /// Returns the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Sets `key` with no expiry, overwriting any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Sets `key` to expire after `ttl`, overwriting any previous value.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Sets `key` with expiry only if it does not already exist.
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Replaces the value at `key` only if it currently equals `expected`.
    ///
    /// The remaining expiry is preserved. Returns `false` if the key is
    /// missing or holds a different value.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently equals `expected`, then publishes
    /// `notify = (channel, message)` if given.
    ///
    /// Check, delete and publish happen as one atomic step. Returns `true` if
    /// the key was deleted.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        notify: Option<(&str, &str)>,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` unconditionally. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns `true` if `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increments the integer at `key` (missing counts as zero).
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically increments the integer at `key` only while it is below `limit`.
    async fn incr_below(&self, key: &str, limit: i64) -> Result<BoundedIncr, StoreError>;

    /// Atomically decrements the integer at `key`, clamping the result at zero.
    async fn decr_clamped(&self, key: &str) -> Result<i64, StoreError>;

    /// Returns every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Appends `value` to the tail of the list at `key`, returning the new length.
    async fn push_back(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pops the head of the list at `key`, waiting up to `timeout` for one to appear.
    ///
    /// Exactly one caller receives each element even with many concurrent
    /// poppers. Returns `None` on timeout.
    async fn pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Returns the length of the list at `key`.
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Removes the list at `key`, returning how many elements it held.
    async fn purge_list(&self, key: &str) -> Result<u64, StoreError>;

    /// Publishes `message` on `channel`.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Subscribes to `channel`. Messages published after this returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Notifications, StoreError>;

    /// Round-trips to the store to check it is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Names of the keys the lane uses, optionally under a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    namespace: Option<String>,
}

impl KeySpace {
    /// Creates a key space; `None` or an empty namespace uses bare key names.
    #[must_use]
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    fn key(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{name}"),
            None => name.to_string(),
        }
    }

    /// Prefix shared by every task record key.
    #[must_use]
    pub fn task_prefix(&self) -> String {
        self.key("task:")
    }

    /// Key of the record for `task_id`: `task:{id}`.
    #[must_use]
    pub fn task(&self, task_id: &uuid::Uuid) -> String {
        format!("{}{task_id}", self.task_prefix())
    }

    /// Prefix shared by every depth slot marker.
    #[must_use]
    pub fn slot_prefix(&self) -> String {
        self.key("slot:")
    }

    /// Key of the marker for the depth slot `task_id` holds: `slot:{id}`.
    #[must_use]
    pub fn slot(&self, task_id: &uuid::Uuid) -> String {
        format!("{}{task_id}", self.slot_prefix())
    }

    /// Key of the queue-depth counter.
    #[must_use]
    pub fn queue_size(&self) -> String {
        self.key("queue_size")
    }

    /// Key of the exclusive lock.
    #[must_use]
    pub fn gpu_lock(&self) -> String {
        self.key("gpu_lock")
    }

    /// Channel on which lock releases are announced.
    #[must_use]
    pub fn gpu_lock_channel(&self) -> String {
        format!("{}:channel", self.gpu_lock())
    }

    /// Key of the FIFO job list.
    #[must_use]
    pub fn task_queue(&self) -> String {
        self.key("task_queue")
    }
}
