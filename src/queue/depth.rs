//! The shared queue-depth counter.
//!
//! Counts tasks admitted but not yet finished. Admission reads it to enforce
//! the maximum depth and callers see it as an estimate of queue length.
//!
//! Every slot is shadowed by a `slot:{task_id}` marker that exists from just
//! before the increment until just after the matching decrement. The markers
//! are what [`DepthCounter::reconcile`] counts, so a repaired counter never
//! drops below the slots still held by in-flight admissions or by finished
//! jobs that have not decremented yet.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::storage::{BoundedIncr, KeySpace, SharedStore, StoreError};

/// Compare-and-swap attempts before reconciliation gives up.
const RECONCILE_ATTEMPTS: usize = 5;

/// Outcome of [`DepthCounter::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A slot was taken; the counter now holds this depth.
    Reserved(u64),
    /// The lane is full at this depth; nothing changed.
    Full(u64),
}

/// Result of [`DepthCounter::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// The counter before repair; `None` if it was missing or unparseable.
    pub previous: Option<u64>,
    /// The counter after repair: the number of held slots.
    pub depth: u64,
}

/// Handle on the `queue_size` counter and its slot markers.
#[derive(Debug, Clone)]
pub struct DepthCounter {
    store: Arc<dyn SharedStore>,
    key: String,
    keys: KeySpace,
    slot_ttl: Duration,
}

impl DepthCounter {
    /// Creates a handle on the key space's counter.
    ///
    /// Slot markers expire after `slot_ttl` so a crashed process cannot
    /// pin one forever; use the task retention period.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, keys: &KeySpace, slot_ttl: Duration) -> Self {
        Self {
            store,
            key: keys.queue_size(),
            keys: keys.clone(),
            slot_ttl,
        }
    }

    /// Current depth, clamped to zero. A missing counter reads as zero.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotAnInteger` if the key holds garbage, or a
    /// store error if it cannot be read.
    pub async fn read(&self) -> Result<u64, StoreError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(0);
        };
        parse(&self.key, &raw)
    }

    /// Takes one slot for `task_id`, atomically checking `max` first when
    /// given.
    ///
    /// # Errors
    ///
    /// Returns a store error if the marker or the increment fails.
    pub async fn reserve(&self, task_id: &Uuid, max: Option<u64>) -> Result<Reservation, StoreError> {
        let slot = self.keys.slot(task_id);
        self.store
            .set_with_expiry(&slot, "1", self.slot_ttl)
            .await?;

        let reserved = match max {
            Some(max) => {
                let limit = i64::try_from(max).unwrap_or(i64::MAX);
                self.store
                    .incr_below(&self.key, limit)
                    .await
                    .map(|incr| match incr {
                        BoundedIncr::Incremented(depth) => Reservation::Reserved(clamp(depth)),
                        BoundedIncr::AtLimit(depth) => Reservation::Full(clamp(depth)),
                    })
            }
            None => self
                .store
                .incr(&self.key)
                .await
                .map(|depth| Reservation::Reserved(clamp(depth))),
        };

        if !matches!(reserved, Ok(Reservation::Reserved(_))) {
            self.drop_marker(task_id, &slot).await;
        }
        reserved
    }

    /// Gives `task_id`'s slot back, never going below zero. Returns the new
    /// depth.
    ///
    /// # Errors
    ///
    /// Returns a store error if the decrement fails.
    pub async fn release(&self, task_id: &Uuid) -> Result<u64, StoreError> {
        let depth = self.release_unmarked().await?;
        self.drop_marker(task_id, &self.keys.slot(task_id)).await;
        Ok(depth)
    }

    /// Releases `task_id`'s slot only if its marker still exists.
    ///
    /// Returns the new depth, or `None` if no slot was held (for example
    /// because recovery already reset the counter).
    ///
    /// # Errors
    ///
    /// Returns a store error if the marker or the counter cannot be updated.
    pub async fn release_if_held(&self, task_id: &Uuid) -> Result<Option<u64>, StoreError> {
        if !self.store.exists(&self.keys.slot(task_id)).await? {
            return Ok(None);
        }
        self.release(task_id).await.map(Some)
    }

    /// Gives back a slot whose owner is unknown.
    ///
    /// # Errors
    ///
    /// Returns a store error if the decrement fails.
    pub async fn release_unmarked(&self) -> Result<u64, StoreError> {
        Ok(clamp(self.store.decr_clamped(&self.key).await?))
    }

    /// Number of slot markers currently held.
    ///
    /// # Errors
    ///
    /// Returns a store error if the scan fails.
    pub async fn held_slots(&self) -> Result<u64, StoreError> {
        let slots = self.store.scan_prefix(&self.keys.slot_prefix()).await?;
        Ok(slots.len() as u64)
    }

    /// Resets the counter to the number of held slots.
    ///
    /// The counter is read before the markers are counted and replaced with
    /// a compare-and-swap, so a concurrent reserve or release forces another
    /// pass instead of being overwritten.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Contended` if the counter kept changing, or a
    /// store error.
    pub async fn reconcile(&self) -> Result<Reconciled, StoreError> {
        for _ in 0..RECONCILE_ATTEMPTS {
            let raw = self.store.get(&self.key).await?;
            let depth = self.held_slots().await?;
            let previous = raw.as_deref().and_then(|r| parse(&self.key, r).ok());

            match raw {
                Some(raw) => {
                    if self
                        .store
                        .compare_and_swap(&self.key, &raw, &depth.to_string())
                        .await?
                    {
                        return Ok(Reconciled { previous, depth });
                    }
                }
                // A missing counter is zero; adding keeps concurrent
                // increments intact.
                None => {
                    for _ in 0..depth {
                        self.store.incr(&self.key).await?;
                    }
                    return Ok(Reconciled { previous, depth });
                }
            }
        }
        Err(StoreError::Contended(self.key.clone()))
    }

    /// Overwrites the counter and drops every slot marker. Only recovery,
    /// with no submitters or executors running, calls this.
    ///
    /// Returns how many markers were removed.
    ///
    /// # Errors
    ///
    /// Returns a store error if a write fails.
    pub async fn reset(&self, depth: u64) -> Result<u64, StoreError> {
        let mut removed = 0;
        for slot in self.store.scan_prefix(&self.keys.slot_prefix()).await? {
            if self.store.delete(&slot).await? {
                removed += 1;
            }
        }
        self.store.set(&self.key, &depth.to_string()).await?;
        Ok(removed)
    }

    async fn drop_marker(&self, task_id: &Uuid, slot: &str) {
        if let Err(e) = self.store.delete(slot).await {
            // A stale marker only makes reconciliation count high until it expires.
            tracing::warn!(task_id = %task_id, error = %e, "Failed to drop depth slot marker");
        }
    }
}

fn parse(key: &str, raw: &str) -> Result<u64, StoreError> {
    let value: i64 = raw.trim().parse().map_err(|_| StoreError::NotAnInteger {
        key: key.to_string(),
        value: raw.to_string(),
    })?;
    Ok(clamp(value))
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn counter(store: &MemoryStore) -> DepthCounter {
        DepthCounter::new(
            Arc::new(store.clone()),
            &KeySpace::default(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_missing_counter_reads_zero() {
        let store = MemoryStore::new();
        assert_eq!(counter(&store).read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_value_reads_zero() {
        let store = MemoryStore::new();
        store.set("queue_size", "-4").await.unwrap();
        assert_eq!(counter(&store).read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserve_respects_max() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(depth.reserve(&a, Some(2)).await.unwrap(), Reservation::Reserved(1));
        assert_eq!(depth.reserve(&b, Some(2)).await.unwrap(), Reservation::Reserved(2));
        assert_eq!(depth.reserve(&c, Some(2)).await.unwrap(), Reservation::Full(2));
        assert_eq!(depth.read().await.unwrap(), 2);

        // Only the two granted slots are marked.
        assert_eq!(depth.held_slots().await.unwrap(), 2);
        assert!(!store.exists(&KeySpace::default().slot(&c)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_reserve() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        for expected in 1..=5 {
            assert_eq!(
                depth.reserve(&Uuid::new_v4(), None).await.unwrap(),
                Reservation::Reserved(expected)
            );
        }
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        let id = Uuid::new_v4();
        depth.reserve(&id, None).await.unwrap();
        assert_eq!(depth.release(&id).await.unwrap(), 0);
        assert_eq!(depth.held_slots().await.unwrap(), 0);
        assert_eq!(depth.release(&id).await.unwrap(), 0);
        assert_eq!(depth.release_unmarked().await.unwrap(), 0);
        assert_eq!(depth.read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_if_held() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        let id = Uuid::new_v4();
        depth.reserve(&id, None).await.unwrap();
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();

        assert_eq!(depth.release_if_held(&id).await.unwrap(), Some(1));
        assert_eq!(depth.release_if_held(&id).await.unwrap(), None);
        assert_eq!(depth.read().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_reported() {
        let store = MemoryStore::new();
        store.set("queue_size", "lots").await.unwrap();
        assert!(matches!(
            counter(&store).read().await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_drops_markers() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();

        assert_eq!(depth.reset(0).await.unwrap(), 2);
        assert_eq!(depth.read().await.unwrap(), 0);
        assert_eq!(depth.held_slots().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_in_flight_reservation() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        // A submitter holds a slot but has not written its record yet.
        depth.reserve(&Uuid::new_v4(), Some(2)).await.unwrap();

        let reconciled = depth.reconcile().await.unwrap();
        assert_eq!(reconciled, Reconciled { previous: Some(1), depth: 1 });
        assert_eq!(depth.read().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_drops_leaked_slots() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();
        // Two increments whose owners crashed before leaving a marker.
        store.incr("queue_size").await.unwrap();
        store.incr("queue_size").await.unwrap();

        let reconciled = depth.reconcile().await.unwrap();
        assert_eq!(reconciled, Reconciled { previous: Some(3), depth: 1 });
        assert_eq!(depth.read().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_garbage_and_missing_counter() {
        let store = MemoryStore::new();
        let depth = counter(&store);
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();
        depth.reserve(&Uuid::new_v4(), None).await.unwrap();

        store.set("queue_size", "lots").await.unwrap();
        let reconciled = depth.reconcile().await.unwrap();
        assert_eq!(reconciled, Reconciled { previous: None, depth: 2 });
        assert_eq!(depth.read().await.unwrap(), 2);

        store.delete("queue_size").await.unwrap();
        assert_eq!(depth.reconcile().await.unwrap().depth, 2);
        assert_eq!(depth.read().await.unwrap(), 2);
    }
}
