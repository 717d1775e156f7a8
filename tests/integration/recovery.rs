//! Test: restart recovery of a crashed instance's state.

use std::sync::Arc;
use std::time::Duration;

use gpulane::models::{TaskPatch, TaskStatus};
use gpulane::queue::{Dequeued, Lane};
use gpulane::storage::SharedStore;
use gpulane::worker::{JobOutcome, RESTART_REASON};

use crate::common::{executor, memory_lane, submission, ExclusiveTracker};

/// A crashed worker left one task processing, two pending, the counter at
/// three and the lock held. A fresh instance recovers before accepting work.
#[tokio::test]
async fn test_restart_fails_interrupted_tasks() {
    let t = memory_lane(Some(3));
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(t.lane.submit(submission(&format!("k-{i}"))).await.unwrap().task_id);
    }

    // Simulate the crash: the dead worker took the first entry, marked it
    // processing, grabbed the lock and never came back.
    let taken = t
        .lane
        .queue()
        .dequeue(Duration::from_millis(10))
        .await
        .unwrap()
        .and_then(Dequeued::into_job)
        .unwrap();
    assert_eq!(taken.task_id, ids[0]);
    t.lane
        .tasks()
        .update(&ids[0], &TaskPatch::processing("dead-worker"))
        .await
        .unwrap();
    let abandoned = t.lane.lock().acquire().await.unwrap();
    drop(abandoned);

    // Lane full until recovery runs.
    assert!(t.lane.submit(submission("blocked")).await.is_err());

    let restarted = Lane::new(Arc::new(t.store.clone()) as Arc<dyn SharedStore>, &t.config);
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.failed_tasks.len(), 3);
    assert!(report.lock_was_held);
    assert_eq!(report.previous_depth, Some(3));
    assert_eq!(report.purged_entries, 2);

    for id in &ids {
        let view = restarted.status(id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Failed);
        assert_eq!(view.task.error.as_deref(), Some(RESTART_REASON));
        assert!(view.task.failed_at.is_some());
    }
    assert_eq!(restarted.depth().read().await.unwrap(), 0);
    assert!(!restarted.lock().is_held().await.unwrap());

    // New work flows normally afterwards.
    let fresh = restarted.submit(submission("after")).await.unwrap();
    assert_eq!(fresh.queue_depth_at_submission, 1);
    let exec = executor(&restarted, "exec-new", Arc::new(ExclusiveTracker::default()));
    let outcome = exec.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { task_id, .. } if task_id == fresh.task_id));
}

/// Recovery is idempotent.
#[tokio::test]
async fn test_recover_twice() {
    let t = memory_lane(None);
    t.lane.submit(submission("x")).await.unwrap();

    let first = t.lane.recover().await.unwrap();
    assert_eq!(first.failed_tasks.len(), 1);

    let second = t.lane.recover().await.unwrap();
    assert!(second.failed_tasks.is_empty());
    assert!(!second.lock_was_held);
    assert_eq!(second.previous_depth, Some(0));
    assert_eq!(second.purged_entries, 0);
}
