//! Executor loops with graceful shutdown.
//!
//! This module provides the long-running worker that:
//! - Warms up the operation once
//! - Runs N executor loops against the lane's queue
//! - Stops taking new jobs on shutdown and lets in-flight jobs finish

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::lock::Backoff;
use crate::queue::Lane;

use super::executor::{Executor, ExecutorSettings, JobOutcome};
use super::handler::ExclusiveOperation;

/// Configuration for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of executor loops.
    pub executors: usize,
    /// Settings shared by every loop; each loop gets its own ID suffix.
    pub executor: ExecutorSettings,
    /// Retry schedule after a store error in the dequeue.
    pub error_backoff: Backoff,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executors: 1,
            executor: ExecutorSettings::default(),
            error_backoff: Backoff::new(100, 5_000, 2.0),
        }
    }
}

/// Totals reported when the runner stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs completed.
    pub completed: usize,
    /// Jobs failed.
    pub failed: usize,
    /// Entries skipped.
    pub skipped: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    /// Jobs that reached the operation or were skipped.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Creates a shutdown signal channel.
///
/// Returns a sender/receiver pair where:
/// - The sender can be used to trigger shutdown by sending `true`
/// - The receiver can be watched to detect shutdown requests
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = shutdown_signal();
/// // Later, trigger shutdown:
/// shutdown_tx.send(true).ok();
/// ```
#[must_use]
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Waits for SIGINT or SIGTERM and triggers shutdown.
///
/// This function blocks until either:
/// - SIGINT (Ctrl+C) is received
/// - SIGTERM is received (Unix only)
///
/// When a signal is received, it sends `true` through the shutdown channel.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = shutdown_signal();
/// tokio::spawn(async move {
///     wait_for_shutdown_signal(shutdown_tx).await;
/// });
/// ```
#[allow(clippy::cognitive_complexity)]
pub async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), finishing in-flight jobs");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, finishing in-flight jobs");
        }
    }

    if let Err(e) = shutdown_tx.send(true) {
        tracing::error!("Failed to send shutdown signal: {}", e);
    }
}

/// Runs executor loops until shutdown.
#[derive(Debug)]
pub struct Runner {
    lane: Lane,
    operation: Arc<dyn ExclusiveOperation>,
    config: RunnerConfig,
}

impl Runner {
    /// Creates a runner for `operation` on `lane`.
    #[must_use]
    pub fn new(lane: Lane, operation: Arc<dyn ExclusiveOperation>, config: RunnerConfig) -> Self {
        Self {
            lane,
            operation,
            config,
        }
    }

    /// Warms up the operation, then runs the loops until `shutdown` flips to
    /// true. An operation in progress is never interrupted; each loop exits
    /// after its current job.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> RunSummary {
        if let Err(e) = self.operation.warm_up().await {
            tracing::warn!(operation = %self.operation.name(), error = %e, "Warm-up failed; continuing");
        }

        let loops = self.config.executors.max(1);
        tracing::info!(
            executors = loops,
            operation = %self.operation.name(),
            "Worker started"
        );

        let mut set = JoinSet::new();
        for i in 0..loops {
            let settings = if loops == 1 {
                self.config.executor.clone()
            } else {
                let id = format!("{}-{i}", self.config.executor.executor_id);
                self.config.executor.clone().with_id(id)
            };
            let executor = Executor::new(&self.lane, Arc::clone(&self.operation), settings);
            set.spawn(executor_loop(
                executor,
                shutdown.clone(),
                self.config.error_backoff,
            ));
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(part) => summary.merge(part),
                Err(e) => tracing::error!(error = %e, "Executor loop ended abnormally"),
            }
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Worker stopped"
        );
        summary
    }
}

async fn executor_loop(
    executor: Executor,
    mut shutdown: watch::Receiver<bool>,
    backoff: Backoff,
) -> RunSummary {
    let mut summary = RunSummary::default();
    let mut error_delay: Option<Duration> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // The dequeue is bounded, so shutdown is noticed within one timeout.
        match executor.poll_once().await {
            Ok(Some(outcome)) => {
                summary.record(&outcome);
                error_delay = None;
            }
            Ok(None) => {
                error_delay = None;
            }
            Err(e) => {
                let delay = error_delay.map_or_else(
                    || backoff.initial_interval(),
                    |d| backoff.next_interval(d),
                );
                error_delay = Some(delay);
                tracing::warn!(executor_id = %executor.id(), error = %e, retry_in = ?delay, "Dequeue failed");

                tokio::select! {
                    () = tokio::time::sleep(backoff.apply_jitter(delay)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(executor_id = %executor.id(), "Executor loop stopped");
    summary
}
