//! CLI commands for gpulane.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// gpulane - serialized job lane for one exclusive GPU
#[derive(Parser, Debug)]
#[command(name = "gpulane", version, about = "Serialized job lane for one exclusive GPU")]
pub struct Cli {
    /// Path to config file (overrides .gpulane.toml)
    #[arg(long, global = true, env = "GPULANE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a job
    Submit {
        /// Input artifact as NAME=PATH (repeatable, at least one)
        #[arg(long = "input", short = 'i', value_name = "NAME=PATH", required = true, value_parser = parse_input_arg)]
        inputs: Vec<(String, PathBuf)>,

        /// Operation parameters as a JSON string
        #[arg(long, short = 'p')]
        params: Option<String>,
    },

    /// Show a task's status
    Status {
        /// Task ID (UUID)
        task_id: Uuid,
    },

    /// List tasks, newest first
    List {
        /// Max tasks to return
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Delete a completed or failed task's record
    Delete {
        /// Task ID (UUID)
        task_id: Uuid,
    },

    /// Show queue, lock and task counts
    Stats {
        /// Reset the depth counter to the number of pending and processing tasks
        #[arg(long)]
        reconcile: bool,
    },

    /// Fail interrupted tasks and clear the counter, lock and queue
    ///
    /// Only run this while no worker is running.
    Recover,

    /// Delete old completed and failed task records
    Trim {
        /// Finished records to keep (default: tasks.keep_on_trim)
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Check connectivity to Redis
    Health,

    /// Run a worker
    Worker {
        /// Run recovery before taking jobs (only when this is the sole worker)
        #[arg(long)]
        recover: bool,

        /// Program (and arguments) run for each job; overrides worker.command
        #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "PROGRAM")]
        command: Option<Vec<String>>,

        /// Executor loops in this process
        #[arg(long)]
        executors: Option<usize>,

        /// Executor ID prefix (default: generated)
        #[arg(long)]
        id: Option<String>,
    },
}

/// Parses `NAME=PATH`.
///
/// # Errors
///
/// Returns a message if the `=` or either side is missing.
pub fn parse_input_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{raw}'"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got '{raw}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

impl Cli {
    /// Parse CLI arguments
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
