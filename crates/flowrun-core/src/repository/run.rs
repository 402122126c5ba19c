//! Run store trait definition.
//!
//! Defines the storage interface for workflow runs and their artifacts: the
//! run document, the definition snapshot taken at start, per-step output
//! artifacts and the cumulative progress log. The infrastructure layer
//! (flowrun-infra) implements this trait on the filesystem.

use flowrun_types::error::StoreError;
use flowrun_types::run::{RunFilter, RunId, WorkflowRun};
use flowrun_types::workflow::WorkflowDefinition;

/// Outcome of appending to a run's progress log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAppend {
    Appended,
    /// The existing log was already over the size cap; nothing was written.
    SkippedLimit { size: u64 },
}

/// Repository trait for run persistence.
///
/// Stores only persist and retrieve; the orchestrator is the only component
/// that mutates runs. Every method takes an already-validated `RunId`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Run documents
    // -----------------------------------------------------------------------

    /// Persist the full run snapshot, creating its container if needed.
    fn save(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load a run, or `None` when it does not exist.
    fn get(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, StoreError>> + Send;

    /// List runs matching `filter`, newest `started_at` first.
    fn list(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Definition snapshots
    // -----------------------------------------------------------------------

    /// Persist the definition a run was started with.
    fn snapshot_definition(
        &self,
        run_id: &RunId,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn load_definition_snapshot(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    /// Persist a step's raw output and return a reference to the artifact.
    fn save_step_output(
        &self,
        run_id: &RunId,
        step_id: &str,
        raw: &str,
    ) -> impl std::future::Future<Output = Result<String, StoreError>> + Send;

    /// The accumulated progress log, or `None` before the first append.
    fn load_progress(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Append an entry to the progress log unless it is over the size cap.
    fn append_progress(
        &self,
        run_id: &RunId,
        entry: &str,
    ) -> impl std::future::Future<Output = Result<ProgressAppend, StoreError>> + Send;
}
