//! Test: the exclusive lock across independent handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpulane::lock::{GpuLock, LockSettings, ReleaseOutcome};
use gpulane::storage::{KeySpace, MemoryStore, SharedStore};

fn lock_on(store: &Arc<dyn SharedStore>, ttl: Duration) -> GpuLock {
    GpuLock::new(
        Arc::clone(store),
        &KeySpace::default(),
        LockSettings {
            ttl,
            ..LockSettings::default()
        },
    )
}

/// Separate handles (standing in for separate processes) never overlap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handles_exclude_each_other() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let lock = lock_on(&store, Duration::from_secs(30));
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                let guard = lock.acquire().await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                assert_eq!(guard.release().await.unwrap(), ReleaseOutcome::Released);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

/// A holder that outlives its TTL loses the lock, and its late release
/// does not delete the new holder's key.
#[tokio::test(start_paused = true)]
async fn test_stale_holder_cannot_release_successor() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let first = lock_on(&store, Duration::from_secs(2));
    let second = lock_on(&store, Duration::from_secs(60));

    let stale = first.acquire().await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;

    let fresh = second.acquire().await.unwrap();
    assert_eq!(stale.release().await.unwrap(), ReleaseOutcome::NotOwner);
    assert!(second.is_held().await.unwrap());
    assert_eq!(fresh.release().await.unwrap(), ReleaseOutcome::Released);
    assert!(!second.is_held().await.unwrap());
}
