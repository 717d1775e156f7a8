//! Test: the Redis-backed store and a full lane on a live Redis.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gpulane::config::LaneConfig;
use gpulane::models::TaskStatus;
use gpulane::queue::Lane;
use gpulane::storage::{BoundedIncr, RedisStore, SharedStore};
use gpulane::worker::JobOutcome;
use uuid::Uuid;

use crate::common::{executor, submission, ExclusiveTracker};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

async fn store() -> RedisStore {
    RedisStore::connect(&redis_url())
        .await
        .expect("Failed to connect to Redis")
}

fn unique(prefix: &str) -> String {
    format!("gpulane-test:{prefix}:{}", Uuid::new_v4())
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires Redis (enable feature integration)"
)]
async fn test_set_if_absent_and_compare_and_delete() {
    let store = store().await;
    let key = unique("lock");
    let channel = format!("{key}:channel");

    let mut notifications = store.subscribe(&channel).await.unwrap();
    assert!(store.set_if_absent(&key, "a", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_if_absent(&key, "b", Duration::from_secs(5)).await.unwrap());

    assert!(!store.compare_and_delete(&key, "b", Some((channel.as_str(), "released"))).await.unwrap());
    assert!(store.compare_and_delete(&key, "a", Some((channel.as_str(), "released"))).await.unwrap());
    assert!(!store.exists(&key).await.unwrap());

    let message = tokio::time::timeout(Duration::from_secs(2), notifications.next())
        .await
        .expect("release notification not delivered");
    assert_eq!(message.as_deref(), Some("released"));
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires Redis (enable feature integration)"
)]
async fn test_counters() {
    let store = store().await;
    let key = unique("depth");

    assert_eq!(store.incr_below(&key, 2).await.unwrap(), BoundedIncr::Incremented(1));
    assert_eq!(store.incr_below(&key, 2).await.unwrap(), BoundedIncr::Incremented(2));
    assert_eq!(store.incr_below(&key, 2).await.unwrap(), BoundedIncr::AtLimit(2));
    assert_eq!(store.decr_clamped(&key).await.unwrap(), 1);
    assert_eq!(store.decr_clamped(&key).await.unwrap(), 0);
    assert_eq!(store.decr_clamped(&key).await.unwrap(), 0);
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires Redis (enable feature integration)"
)]
async fn test_compare_and_swap_keeps_ttl() {
    let store = store().await;
    let key = unique("record");

    store.set_with_expiry(&key, "v1", Duration::from_secs(60)).await.unwrap();
    assert!(!store.compare_and_swap(&key, "other", "v2").await.unwrap());
    assert!(store.compare_and_swap(&key, "v1", "v2").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v2"));
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires Redis (enable feature integration)"
)]
async fn test_list_and_scan() {
    let store = store().await;
    let key = unique("queue");

    store.push_back(&key, "one").await.unwrap();
    store.push_back(&key, "two").await.unwrap();
    assert_eq!(store.list_len(&key).await.unwrap(), 2);
    assert_eq!(
        store.pop_front_blocking(&key, Duration::from_millis(100)).await.unwrap().as_deref(),
        Some("one")
    );
    assert_eq!(store.scan_prefix(&key).await.unwrap(), vec![key.clone()]);
    assert_eq!(store.purge_list(&key).await.unwrap(), 1);
    assert!(store
        .pop_front_blocking(&key, Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires Redis (enable feature integration)"
)]
async fn test_lane_end_to_end() {
    let staging = tempfile::tempdir().unwrap();
    let mut config = LaneConfig::default();
    config.redis_url = redis_url();
    config.namespace = Some(unique("lane"));
    config.staging.dir = staging.path().to_path_buf();
    config.admission.max_queue_depth = Some(2);

    let lane = Lane::connect(&config).await.unwrap();
    let report = lane.recover().await.unwrap();
    assert!(report.failed_tasks.is_empty());

    let accepted = lane.submit(submission("redis")).await.unwrap();
    assert_eq!(accepted.queue_depth_at_submission, 1);

    let exec = executor(&lane, "exec-redis", Arc::new(ExclusiveTracker::default()));
    let outcome = exec.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { .. }));

    let view = lane.status(&accepted.task_id).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Completed);
    assert_eq!(view.queue_depth, Some(0));

    lane.delete_task(&accepted.task_id).await.unwrap();
    assert_eq!(lane.list(10).await.unwrap().total, 0);
}
