//! Durable staging of submitted input artifacts.
//!
//! Submitters persist inputs here before enqueueing so that an executor in
//! another process (or on another host sharing the directory) can read them
//! by path. Executors delete them once the task is finished.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::models::StagedInput;

const MAX_INPUT_NAME_LEN: usize = 64;

/// Returns true if `name` is usable as an input name (and so in a file name).
#[must_use]
pub fn is_valid_input_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INPUT_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Writes, reads and removes staged inputs under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    root: PathBuf,
}

impl ArtifactStager {
    /// Creates a stager rooted at `root`. The directory is created on first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The staging directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists one input for `task_id`.
    ///
    /// The bytes are written to a temporary name and renamed into place, so a
    /// reader never sees a partial file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unusable name, or the underlying I/O error.
    pub async fn stage(
        &self,
        task_id: &Uuid,
        name: &str,
        bytes: &[u8],
    ) -> io::Result<StagedInput> {
        if !is_valid_input_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid input name '{name}'"),
            ));
        }
        fs::create_dir_all(&self.root).await?;

        let path = self.root.join(format!("{task_id}_{name}"));
        let partial = self.root.join(format!(".{task_id}_{name}.part"));
        fs::write(&partial, bytes).await?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        Ok(StagedInput {
            name: name.to_string(),
            path,
        })
    }

    /// Reads a staged input back.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file is missing or unreadable.
    pub async fn load(&self, input: &StagedInput) -> io::Result<Vec<u8>> {
        fs::read(&input.path).await
    }

    /// Deletes staged inputs. Paths outside the staging directory are left
    /// alone. Failures are logged. Returns the number of files removed.
    pub async fn discard(&self, inputs: &[StagedInput]) -> usize {
        let mut removed = 0;
        for input in inputs {
            if !input.path.starts_with(&self.root) {
                tracing::warn!(
                    path = %input.path.display(),
                    root = %self.root.display(),
                    "Not deleting input outside the staging directory"
                );
                continue;
            }
            match fs::remove_file(&input.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %input.path.display(), error = %e, "Failed to delete staged input");
                }
            }
        }
        removed
    }

    /// Deletes every file in the staging directory. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory exists but cannot be listed.
    pub async fn purge_all(&self) -> io::Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to delete staged file");
                }
            }
        }
        Ok(removed)
    }
}
