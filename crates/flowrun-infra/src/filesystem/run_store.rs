//! Filesystem-backed `RunStore`.
//!
//! Each run owns a directory under `{data_dir}/runs/`:
//!
//! ```text
//! runs/<run_id>/run.json            pretty JSON run document
//! runs/<run_id>/workflow.yml        definition snapshot taken at start
//! runs/<run_id>/progress.md         cumulative progress log
//! runs/<run_id>/step-outputs/*.md   raw step outputs
//! ```

use std::path::{Path, PathBuf};

use flowrun_core::repository::{ProgressAppend, RunStore};
use flowrun_core::workflow::definition::step_output_file_name;
use flowrun_types::error::StoreError;
use flowrun_types::run::{RunFilter, RunId, WorkflowRun};
use flowrun_types::workflow::WorkflowDefinition;
use tokio::io::AsyncWriteExt;

use super::{read_optional, write_atomic};

const RUN_FILE: &str = "run.json";
const DEFINITION_FILE: &str = "workflow.yml";
const PROGRESS_FILE: &str = "progress.md";
const OUTPUTS_DIR: &str = "step-outputs";

#[derive(Debug, Clone)]
pub struct FileRunStore {
    runs_dir: PathBuf,
    progress_limit_bytes: u64,
}

impl FileRunStore {
    /// Create a store rooted at `runs_dir` (normally `{data_dir}/runs`).
    pub fn new(runs_dir: impl Into<PathBuf>, progress_limit_bytes: u64) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            progress_limit_bytes,
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Directory holding every artifact of `run_id`.
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }

    async fn read_run(&self, path: &Path) -> Result<Option<WorkflowRun>, StoreError> {
        match read_optional(path).await? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }
}

impl RunStore for FileRunStore {
    async fn save(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(run)?;
        write_atomic(&self.run_dir(&run.id).join(RUN_FILE), json.as_bytes()).await?;
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError> {
        self.read_run(&self.run_dir(run_id).join(RUN_FILE)).await
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if RunId::parse(name).is_err() {
                tracing::debug!(entry = name, "skipping non-run entry");
                continue;
            }

            match self.read_run(&entry.path().join(RUN_FILE)).await {
                Ok(Some(run)) if filter.matches(&run) => runs.push(run),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(run_id = name, error = %err, "skipping unreadable run document");
                }
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn snapshot_definition(
        &self,
        run_id: &RunId,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        let yaml = serde_yaml_ng::to_string(definition)?;
        write_atomic(&self.run_dir(run_id).join(DEFINITION_FILE), yaml.as_bytes()).await?;
        Ok(())
    }

    async fn load_definition_snapshot(
        &self,
        run_id: &RunId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        match read_optional(&self.run_dir(run_id).join(DEFINITION_FILE)).await? {
            Some(content) => Ok(Some(serde_yaml_ng::from_str(&content)?)),
            None => Ok(None),
        }
    }

    async fn save_step_output(
        &self,
        run_id: &RunId,
        step_id: &str,
        raw: &str,
    ) -> Result<String, StoreError> {
        let path = self
            .run_dir(run_id)
            .join(OUTPUTS_DIR)
            .join(step_output_file_name(step_id));
        write_atomic(&path, raw.as_bytes()).await?;
        Ok(path.display().to_string())
    }

    async fn load_progress(&self, run_id: &RunId) -> Result<Option<String>, StoreError> {
        Ok(read_optional(&self.run_dir(run_id).join(PROGRESS_FILE)).await?)
    }

    async fn append_progress(
        &self,
        run_id: &RunId,
        entry: &str,
    ) -> Result<ProgressAppend, StoreError> {
        let run_dir = self.run_dir(run_id);
        let path = run_dir.join(PROGRESS_FILE);

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if size > self.progress_limit_bytes {
            return Ok(ProgressAppend::SkippedLimit { size });
        }

        tokio::fs::create_dir_all(&run_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(ProgressAppend::Appended)
    }
}
