//! Task records and queue entries.

mod job;
mod task;

pub use job::{Job, StagedInput};
pub use task::{Milestone, TaskPatch, TaskRecord, TaskStatus, TransitionError};
