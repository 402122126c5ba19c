//! Workflow definition source port.
//!
//! Resolves a workflow ID to its definition. Read-only to the engine.

use std::future::Future;

use flowrun_types::workflow::WorkflowDefinition;

use crate::workflow::definition::DefinitionError;

pub trait DefinitionSource: Send + Sync {
    /// Load a definition by ID, or `None` when no such workflow exists.
    fn load_workflow(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, DefinitionError>> + Send;

    /// Every definition the source can resolve.
    fn list_workflows(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinition>, DefinitionError>> + Send;
}
