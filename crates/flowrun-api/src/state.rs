//! Application state wiring the engine together.
//!
//! AppState pins the generic `RunOrchestrator` to the filesystem stores and
//! picks the agent executor from config.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use flowrun_core::event::EventBus;
use flowrun_core::workflow::{AdmissionControl, RunOrchestrator};
use flowrun_infra::agent::select_agent_executor;
use flowrun_infra::filesystem::{
    FileDefinitionStore, FileRunStore, FileTaskSource, runs_dir, tasks_dir, workflows_dir,
};
use flowrun_types::config::EngineConfig;

/// Orchestrator pinned to the filesystem implementations.
pub type ConcreteOrchestrator = RunOrchestrator<FileRunStore, FileDefinitionStore>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Create the data directory and wire stores, executor and orchestrator.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(runs_dir(&data_dir))
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let store = Arc::new(FileRunStore::new(
            runs_dir(&data_dir),
            config.progress_log_limit_bytes,
        ));
        let definitions = Arc::new(FileDefinitionStore::new(workflows_dir(&data_dir)));
        let tasks = Arc::new(FileTaskSource::new(tasks_dir(&data_dir)));

        let orchestrator = RunOrchestrator::new(
            store,
            definitions,
            select_agent_executor(&config.agent),
            AdmissionControl::new(config.max_concurrent_runs),
            EventBus::new(config.event_capacity),
        )
        .with_task_source(tasks)
        .with_max_redirects(config.max_redirects);

        tracing::debug!(
            data_dir = %data_dir.display(),
            max_concurrent_runs = config.max_concurrent_runs,
            "application state initialized"
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            data_dir,
        })
    }
}
