//! gpulane - a serialized, crash-tolerant job lane for one exclusive GPU
//!
//! Many stateless front ends submit jobs concurrently; one or more worker
//! processes run them strictly one at a time. Coordination lives entirely in
//! Redis: per-task status records with a retention TTL, an atomic depth
//! counter for admission control, a FIFO job list, and a token lock with
//! server-side expiry so a crashed holder cannot wedge the GPU forever.
//!
//! ```ignore
//! let lane = Lane::connect(&load_config(None)?).await?;
//! let accepted = lane
//!     .submit(Submission::new(vec![InputArtifact::new("source", bytes)]))
//!     .await?;
//! let view = lane.status(&accepted.task_id).await?;
//! ```

pub mod cli;
pub mod config;
pub mod lock;
pub mod models;
pub mod queue;
pub mod storage;
pub mod worker;

pub use config::{load_config, LaneConfig};
pub use lock::{GpuLock, LockError, LockGuard, ReleaseOutcome};
pub use models::{Job, Milestone, TaskPatch, TaskRecord, TaskStatus};
pub use queue::{
    Accepted, InputArtifact, Lane, LaneError, LaneStats, RichError, StatusView, Submission,
};
pub use storage::{KeySpace, MemoryStore, RedisStore, SharedStore, StoreError};
pub use worker::{
    recover, CommandOperation, ExclusiveOperation, Executor, ExecutorSettings, JobContext,
    JobOutcome, OperationError, OperationOutput, RecoveryReport, Runner, RunnerConfig,
};
