//! In-memory `RunStore` for embedding and tests.

use std::collections::HashMap;

use flowrun_types::error::StoreError;
use flowrun_types::run::{RunFilter, RunId, WorkflowRun};
use flowrun_types::workflow::WorkflowDefinition;
use tokio::sync::RwLock;

use super::run::{ProgressAppend, RunStore};

#[derive(Debug, Default)]
struct RunRecord {
    run: Option<WorkflowRun>,
    definition: Option<WorkflowDefinition>,
    outputs: HashMap<String, String>,
    progress: Option<String>,
}

/// Run store that keeps everything in a map. Nothing survives the process.
#[derive(Debug)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<RunId, RunRecord>>,
    progress_limit_bytes: u64,
}

impl MemoryRunStore {
    pub fn new(progress_limit_bytes: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            progress_limit_bytes,
        }
    }

    /// Raw output stored for a step, if any.
    pub async fn step_output(&self, run_id: &RunId, step_id: &str) -> Option<String> {
        let records = self.records.read().await;
        records
            .get(run_id)
            .and_then(|r| r.outputs.get(step_id).cloned())
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

impl RunStore for MemoryRunStore {
    async fn save(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.entry(run.id.clone()).or_default().run = Some(run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(run_id).and_then(|r| r.run.clone()))
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let records = self.records.read().await;
        let mut runs: Vec<WorkflowRun> = records
            .values()
            .filter_map(|r| r.run.as_ref())
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn snapshot_definition(
        &self,
        run_id: &RunId,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.entry(run_id.clone()).or_default().definition = Some(definition.clone());
        Ok(())
    }

    async fn load_definition_snapshot(
        &self,
        run_id: &RunId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(run_id).and_then(|r| r.definition.clone()))
    }

    async fn save_step_output(
        &self,
        run_id: &RunId,
        step_id: &str,
        raw: &str,
    ) -> Result<String, StoreError> {
        let mut records = self.records.write().await;
        records
            .entry(run_id.clone())
            .or_default()
            .outputs
            .insert(step_id.to_string(), raw.to_string());
        Ok(format!("memory://{run_id}/step-outputs/{step_id}.md"))
    }

    async fn load_progress(&self, run_id: &RunId) -> Result<Option<String>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(run_id).and_then(|r| r.progress.clone()))
    }

    async fn append_progress(
        &self,
        run_id: &RunId,
        entry: &str,
    ) -> Result<ProgressAppend, StoreError> {
        let mut records = self.records.write().await;
        let progress = records
            .entry(run_id.clone())
            .or_default()
            .progress
            .get_or_insert_with(String::new);
        let size = progress.len() as u64;
        if size > self.progress_limit_bytes {
            return Ok(ProgressAppend::SkippedLimit { size });
        }
        progress.push_str(entry);
        Ok(ProgressAppend::Appended)
    }
}
