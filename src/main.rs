//! gpulane - serialized job lane for one exclusive GPU

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use gpulane::cli::{Cli, Commands};
use gpulane::config::{load_config, ConfigError, LaneConfig};
use gpulane::models::TaskRecord;
use gpulane::queue::{InputArtifact, Lane, LaneError, Submission};
use gpulane::storage::StoreError;
use gpulane::worker::{
    shutdown_signal, wait_for_shutdown_signal, CommandOperation, ExecutorSettings, Runner,
    RunnerConfig,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Displays an error with rich context and suggestions if available.
///
/// Known library errors carry a suggestion; anything else is printed with
/// its cause chain.
fn display_error(err: &anyhow::Error) {
    if let Some(lane_err) = err.downcast_ref::<LaneError>() {
        eprintln!("{}", lane_err.display_rich());
        return;
    }

    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        eprintln!("{}", store_err.display_rich());
        return;
    }

    if let Some(config_err) = err.downcast_ref::<ConfigError>() {
        eprintln!("Configuration error: {config_err}");
        return;
    }

    // Check the error chain for lane errors
    for cause in err.chain() {
        if let Some(lane_err) = cause.downcast_ref::<LaneError>() {
            eprintln!("Error: {err}\n");
            eprintln!("Caused by: {}", lane_err.display_rich());
            return;
        }
    }

    eprintln!("Error: {err:#}");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_task(task: &TaskRecord, queue_depth: Option<u64>) {
    println!("Task: {}", task.task_id);
    println!("  Status: {}", task.status.display_name());
    println!("  Progress: {}%", task.progress);
    println!("  Message: {}", task.message);
    println!(
        "  Queue: depth {} at submission, {} ahead",
        task.queue_depth_at_submission, task.queue_ahead
    );
    if let Some(depth) = queue_depth {
        println!("  Current Queue Depth: {depth}");
    }
    if let Some(ref executor) = task.executor_id {
        println!("  Executor: {executor}");
    }
    if let Some(ref result_ref) = task.result_ref {
        println!("  Result: {result_ref}");
    }
    if let Some(ref error) = task.error {
        println!("  Error: {error}");
    }
    println!("  Created: {}", task.created_at);
    if let Some(started) = task.started_at {
        println!("  Started: {started}");
    }
    if let Some(finished) = task.finished_at() {
        println!("  Finished: {finished}");
    }
}

async fn read_inputs(inputs: Vec<(String, std::path::PathBuf)>) -> Result<Vec<InputArtifact>> {
    let mut artifacts = Vec::with_capacity(inputs.len());
    for (name, path) in inputs {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read input '{name}' from {}", path.display()))?;
        artifacts.push(InputArtifact::new(name, bytes));
    }
    Ok(artifacts)
}

async fn run_worker(
    lane: Lane,
    config: &LaneConfig,
    recover: bool,
    command: Option<Vec<String>>,
    executors: Option<usize>,
    id: Option<String>,
    json: bool,
) -> Result<()> {
    let argv = command
        .or_else(|| config.worker.command.clone())
        .ok_or_else(|| {
            anyhow!("No operation configured. Pass --command PROGRAM or set worker.command.")
        })?;
    let operation = CommandOperation::new(argv)?;

    if recover {
        let report = lane.recover().await?;
        if !json {
            println!(
                "Recovered: {} task(s) failed, lock {}, {} queued entr(ies) dropped",
                report.failed_tasks.len(),
                if report.lock_was_held { "cleared" } else { "was free" },
                report.purged_entries
            );
        }
    }

    let mut executor = ExecutorSettings::from_config(&config.worker);
    if let Some(id) = id {
        executor = executor.with_id(id);
    }
    let runner = Runner::new(
        lane,
        Arc::new(operation),
        RunnerConfig {
            executors: executors.unwrap_or(config.worker.executors),
            executor,
            ..RunnerConfig::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx));

    let summary = runner.run(shutdown_rx).await;
    if json {
        print_json(&serde_json::json!({
            "completed": summary.completed,
            "failed": summary.failed,
            "skipped": summary.skipped,
        }))?;
    } else {
        println!(
            "Worker stopped: {} completed, {} failed, {} skipped",
            summary.completed, summary.failed, summary.skipped
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        display_error(&e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let config = load_config(cli.config.as_deref())?;
    let lane = Lane::connect(&config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Submit { inputs, params } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("--params is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let submission = Submission::new(read_inputs(inputs).await?).with_params(params);
            let accepted = lane.submit(submission).await?;

            if json {
                print_json(&accepted)?;
            } else {
                println!(
                    "Task submitted: {} (queue depth {}, {} ahead)",
                    accepted.task_id, accepted.queue_depth_at_submission, accepted.queue_ahead
                );
            }
        }

        Commands::Status { task_id } => {
            let view = lane.status(&task_id).await?;
            if json {
                print_json(&view)?;
            } else {
                print_task(&view.task, view.queue_depth);
            }
        }

        Commands::List { limit } => {
            let list = lane.list(limit).await?;
            if json {
                print_json(&list)?;
            } else if list.tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!(
                    "{:<36}  {:<10}  {:>4}  {:<25}  MESSAGE",
                    "TASK ID", "STATUS", "PCT", "CREATED"
                );
                for task in &list.tasks {
                    println!(
                        "{:<36}  {:<10}  {:>3}%  {:<25}  {}",
                        task.task_id,
                        task.status.as_str(),
                        task.progress,
                        task.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        task.message
                    );
                }
                if list.total > list.tasks.len() {
                    println!("({} of {} shown)", list.tasks.len(), list.total);
                }
            }
        }

        Commands::Delete { task_id } => {
            lane.delete_task(&task_id).await?;
            if json {
                print_json(&serde_json::json!({ "deleted": task_id }))?;
            } else {
                println!("Task deleted: {task_id}");
            }
        }

        Commands::Stats { reconcile } => {
            let stats = lane.stats(reconcile).await?;
            if json {
                print_json(&stats)?;
            } else {
                println!("Tasks: {} total", stats.total);
                println!("  Pending: {}", stats.counts.pending);
                println!("  Processing: {}", stats.counts.processing);
                println!("  Completed: {}", stats.counts.completed);
                println!("  Failed: {}", stats.counts.failed);
                match stats.max_queue_depth {
                    Some(max) => println!("Queue Depth: {} of {max}", stats.queue_depth),
                    None => println!("Queue Depth: {} (unlimited)", stats.queue_depth),
                }
                println!("Queued Entries: {}", stats.queued_entries);
                println!(
                    "GPU Lock: {}",
                    if stats.lock_held { "held" } else { "free" }
                );
                println!("Max Concurrency: {}", stats.max_concurrency);
                if let Some(previous) = stats.reconciled_from {
                    println!("Counter reconciled from {previous}");
                }
            }
        }

        Commands::Recover => {
            let report = lane.recover().await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Recovery complete:");
                println!("  Tasks failed: {}", report.failed_tasks.len());
                for id in &report.failed_tasks {
                    println!("    {id}");
                }
                println!("  Lock was held: {}", report.lock_was_held);
                match report.previous_depth {
                    Some(depth) => println!("  Previous queue depth: {depth}"),
                    None => println!("  Previous queue depth: unreadable"),
                }
                println!("  Queue entries dropped: {}", report.purged_entries);
                println!("  Staged files removed: {}", report.discarded_files);
            }
        }

        Commands::Trim { keep } => {
            let keep = keep.unwrap_or(config.tasks.keep_on_trim);
            let removed = lane.trim(keep).await?;
            if json {
                print_json(&serde_json::json!({ "removed": removed, "keep": keep }))?;
            } else {
                println!("Removed {removed} finished task record(s), kept the newest {keep}");
            }
        }

        Commands::Health => {
            let report = lane.health().await;
            if json {
                print_json(&report)?;
            } else if report.healthy {
                println!("\u{2713} Redis reachable at {}", config.redis_url);
            }
            if !report.healthy {
                return Err(anyhow!(
                    "Redis unreachable at {}: {}",
                    config.redis_url,
                    report.error.unwrap_or_default()
                ));
            }
        }

        Commands::Worker {
            recover,
            command,
            executors,
            id,
        } => {
            run_worker(lane, &config, recover, command, executors, id, json).await?;
        }
    }

    Ok(())
}
