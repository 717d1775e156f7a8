use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An input artifact persisted by the submitter for an executor to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedInput {
    /// Logical name of the input (for example `source` or `template`).
    pub name: String,
    /// Durable location of the staged bytes.
    pub path: PathBuf,
}

/// A queue entry: everything an executor needs to run one task.
///
/// Written once by the admission gate and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Task this entry executes.
    pub task_id: Uuid,
    /// Staged input artifacts, in submission order.
    #[serde(default)]
    pub inputs: Vec<StagedInput>,
    /// Operation parameters.
    #[serde(default)]
    pub params: Value,
    /// Queue depth observed at admission.
    #[serde(default)]
    pub queue_depth_at_submission: u64,
}

impl Job {
    /// Paths of every staged input.
    pub fn input_paths(&self) -> impl Iterator<Item = &std::path::Path> {
        self.inputs.iter().map(|input| input.path.as_path())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_job_decodes_with_missing_optional_fields() {
        let id = Uuid::new_v4();
        let job: Job = serde_json::from_str(&format!(r#"{{"task_id":"{id}"}}"#)).unwrap();
        assert_eq!(job.task_id, id);
        assert!(job.inputs.is_empty());
        assert_eq!(job.params, Value::Null);
    }
}
