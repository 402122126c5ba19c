//! Workflow definitions stored as YAML files.
//!
//! A workflow with ID `feature` lives at `{data_dir}/workflows/feature.yml`
//! (or `.yaml`). The document's `id` must match its file name.

use std::path::{Path, PathBuf};

use flowrun_core::service::DefinitionSource;
use flowrun_core::workflow::definition::{DefinitionError, parse_workflow_yaml};
use flowrun_types::workflow::WorkflowDefinition;

use super::{read_optional, sanitize_file_name};

const EXTENSIONS: [&str; 2] = ["yml", "yaml"];

#[derive(Debug, Clone)]
pub struct FileDefinitionStore {
    workflows_dir: PathBuf,
}

impl FileDefinitionStore {
    pub fn new(workflows_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflows_dir: workflows_dir.into(),
        }
    }

    pub fn workflows_dir(&self) -> &Path {
        &self.workflows_dir
    }

    async fn load_file(&self, path: &Path) -> Result<Option<WorkflowDefinition>, DefinitionError> {
        match read_optional(path).await? {
            Some(content) => parse_workflow_yaml(&content)
                .map(Some)
                .map_err(|err| match err {
                    DefinitionError::Parse(msg) => {
                        DefinitionError::Parse(format!("{}: {msg}", path.display()))
                    }
                    DefinitionError::Validation(msg) => {
                        DefinitionError::Validation(format!("{}: {msg}", path.display()))
                    }
                    other => other,
                }),
            None => Ok(None),
        }
    }
}

impl DefinitionSource for FileDefinitionStore {
    async fn load_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, DefinitionError> {
        if sanitize_file_name(workflow_id).as_deref() != Some(workflow_id) {
            return Err(DefinitionError::Validation(format!(
                "workflow ID '{workflow_id}' contains illegal characters"
            )));
        }

        for ext in EXTENSIONS {
            let path = self.workflows_dir.join(format!("{workflow_id}.{ext}"));
            if let Some(definition) = self.load_file(&path).await? {
                if definition.id != workflow_id {
                    return Err(DefinitionError::Validation(format!(
                        "{} declares workflow ID '{}'",
                        path.display(),
                        definition.id
                    )));
                }
                tracing::debug!(workflow_id, path = %path.display(), "loaded workflow definition");
                return Ok(Some(definition));
            }
        }
        Ok(None)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        let mut entries = match tokio::fs::read_dir(&self.workflows_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut definitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e));
            if !is_yaml {
                continue;
            }
            match self.load_file(&path).await {
                Ok(Some(definition)) => definitions.push(definition),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping invalid workflow file");
                }
            }
        }

        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }
}
