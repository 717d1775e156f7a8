//! Test: several executors draining one queue.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use gpulane::models::TaskStatus;
use gpulane::worker::{ExclusiveOperation, JobOutcome};

use crate::common::{executor, memory_lane, submission, ExclusiveTracker};

/// Two executors race over ten entries with one-second dequeue timeouts:
/// exactly ten distinct terminal tasks, none run twice, none lost, and never
/// two operations at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_executors_drain_ten_entries() {
    let t = memory_lane(None);
    let mut submitted = HashSet::new();
    for i in 0..10 {
        submitted.insert(t.lane.submit(submission(&format!("r-{i}"))).await.unwrap().task_id);
    }

    let tracker = Arc::new(ExclusiveTracker::default());
    let mut handles = Vec::new();
    for name in ["exec-a", "exec-b"] {
        let op: Arc<dyn ExclusiveOperation> = tracker.clone();
        let exec = executor(&t.lane, name, op);
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(outcome) = exec.poll_once().await.unwrap() {
                seen.push(outcome);
            }
            seen
        }));
    }

    let mut processed = Vec::new();
    for handle in handles {
        processed.extend(handle.await.unwrap());
    }

    assert_eq!(processed.len(), 10);
    let ids: HashSet<_> = processed.iter().map(JobOutcome::task_id).collect();
    assert_eq!(ids, submitted);
    assert!(processed
        .iter()
        .all(|o| matches!(o, JobOutcome::Completed { .. })));
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 10);
    assert_eq!(tracker.max_inside.load(Ordering::SeqCst), 1);

    for id in &submitted {
        let record = t.lane.tasks().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }
    assert_eq!(t.lane.depth().read().await.unwrap(), 0);
    assert!(!t.lane.lock().is_held().await.unwrap());
    assert_eq!(std::fs::read_dir(t.staging.path()).unwrap().count(), 0);
}
