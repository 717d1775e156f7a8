//! Executors, the worker runner, and restart recovery.

mod command;
mod executor;
mod handler;
mod recovery;
mod runner;

pub use command::CommandOperation;
pub use executor::{
    generate_executor_id, Executor, ExecutorSettings, JobOutcome, SkipReason,
};
pub use handler::{
    CancelHandle, Cancellation, ExclusiveOperation, JobContext, LoadedInput, OperationError,
    OperationOutput, ProgressReporter,
};
pub use recovery::{recover, RecoveryReport, RESTART_MESSAGE, RESTART_REASON};
pub use runner::{shutdown_signal, wait_for_shutdown_signal, RunSummary, Runner, RunnerConfig};
