//! Shared fixtures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpulane::config::LaneConfig;
use gpulane::queue::{InputArtifact, Lane, Submission};
use gpulane::storage::{MemoryStore, SharedStore};
use gpulane::worker::{
    ExclusiveOperation, Executor, ExecutorSettings, JobContext, OperationError, OperationOutput,
};
use tempfile::TempDir;

/// A lane on a fresh in-memory store with its own staging directory.
pub struct TestLane {
    pub store: MemoryStore,
    pub lane: Lane,
    pub config: LaneConfig,
    pub staging: TempDir,
}

pub fn memory_lane(max_queue_depth: Option<u64>) -> TestLane {
    let store = MemoryStore::new();
    let staging = tempfile::tempdir().expect("create staging dir");
    let mut config = LaneConfig::default();
    config.staging.dir = staging.path().to_path_buf();
    config.admission.max_queue_depth = max_queue_depth;
    let shared: Arc<dyn SharedStore> = Arc::new(store.clone());
    let lane = Lane::new(shared, &config);
    TestLane {
        store,
        lane,
        config,
        staging,
    }
}

pub fn submission(tag: &str) -> Submission {
    Submission::new(vec![InputArtifact::new("source", tag.as_bytes().to_vec())])
}

pub fn executor(lane: &Lane, id: &str, op: Arc<dyn ExclusiveOperation>) -> Executor {
    Executor::new(
        lane,
        op,
        ExecutorSettings {
            executor_id: id.to_string(),
            dequeue_timeout: Duration::from_secs(1),
            operation_timeout: None,
        },
    )
}

/// Sleeps briefly while asserting nobody else is inside.
#[derive(Default)]
pub struct ExclusiveTracker {
    inside: AtomicUsize,
    pub max_inside: AtomicUsize,
    pub runs: AtomicUsize,
}

#[async_trait]
impl ExclusiveOperation for ExclusiveTracker {
    fn name(&self) -> &str {
        "tracker"
    }

    async fn run(&self, ctx: &JobContext) -> Result<OperationOutput, OperationError> {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(OperationOutput::with_ref(format!("results/{}", ctx.task_id)))
    }
}
