//! An operation that runs an external program per job.
//!
//! The program receives the staged input paths as trailing arguments and the
//! job parameters as JSON on stdin. It reports back on stdout:
//!
//! ```text
//! progress detection_done     # or a percentage: progress 30
//! result /srv/results/abc.jpg
//! ```
//!
//! Other stdout lines are logged at debug level. A non-zero exit status is a
//! failure carrying the program's stderr. On cancellation the program is
//! killed and reaped before `run` returns.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::models::Milestone;

use super::handler::{ExclusiveOperation, JobContext, OperationError, OperationOutput};

/// Longest stderr excerpt kept in an error message.
const MAX_STDERR_LEN: usize = 2000;

/// Runs `program args... input_paths...` for each job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOperation {
    program: String,
    args: Vec<String>,
}

impl CommandOperation {
    /// Builds an operation from a command line (program first).
    ///
    /// # Errors
    ///
    /// Returns `OperationError::InvalidInput` if `argv` is empty.
    pub fn new(argv: Vec<String>) -> Result<Self, OperationError> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| OperationError::InvalidInput("empty command".to_string()))?;
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }

    /// The program path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Report {
    Progress(Milestone),
    Result(String),
    Other,
}

fn parse_line(line: &str) -> Report {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("progress ") {
        return Milestone::parse(rest).map_or(Report::Other, Report::Progress);
    }
    if let Some(rest) = line.strip_prefix("result ") {
        let reference = rest.trim();
        if !reference.is_empty() {
            return Report::Result(reference.to_string());
        }
    }
    Report::Other
}

#[async_trait]
impl ExclusiveOperation for CommandOperation {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, ctx: &JobContext) -> Result<OperationOutput, OperationError> {
        let params = serde_json::to_vec(&ctx.params)
            .map_err(|e| OperationError::InvalidInput(format!("params are not encodable: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(ctx.inputs.iter().map(|input| &input.path))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OperationError::Failed(format!("could not start {}: {e}", self.program)))?;

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A program that ignores stdin may close it early.
                let _ = stdin.write_all(&params).await;
            }
        });

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let mut result_ref = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    () = ctx.cancel.cancelled() => {
                        return Err(stop(&mut child, &self.program).await);
                    }
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        stop(&mut child, &self.program).await;
                        return Err(OperationError::Failed(format!("reading output failed: {e}")));
                    }
                };
                match parse_line(&line) {
                    Report::Progress(milestone) => ctx.progress.report(milestone).await,
                    Report::Result(reference) => result_ref = Some(reference),
                    Report::Other => {
                        tracing::debug!(task_id = %ctx.task_id, line = %line, "Operation output");
                    }
                }
            }
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = ctx.cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            return Err(stop(&mut child, &self.program).await);
        };
        let status = status.map_err(|e| {
            OperationError::Failed(format!("waiting for {} failed: {e}", self.program))
        })?;
        let _ = writer.await;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            let mut detail = stderr.trim().to_string();
            if detail.len() > MAX_STDERR_LEN {
                let mut cut = MAX_STDERR_LEN;
                while !detail.is_char_boundary(cut) {
                    cut -= 1;
                }
                detail.truncate(cut);
            }
            return Err(OperationError::Failed(if detail.is_empty() {
                format!("{} exited with {status}", self.program)
            } else {
                format!("{} exited with {status}: {detail}", self.program)
            }));
        }

        Ok(OperationOutput {
            result_ref,
            details: None,
        })
    }
}

/// Kills `child` and waits for it to exit.
async fn stop(child: &mut Child, program: &str) -> OperationError {
    if let Err(e) = child.kill().await {
        tracing::warn!(program = %program, error = %e, "Failed to kill operation process");
    }
    OperationError::Failed(format!("{program} was stopped"))
}
