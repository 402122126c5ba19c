//! Workflow definition parsing and structural validation.
//!
//! Converts between YAML documents and `WorkflowDefinition`, and checks the
//! constraints the orchestrator relies on (at least one step, unique step
//! IDs and artifact names, agent steps naming an agent, redirect targets
//! that exist).

use std::collections::{HashMap, HashSet};

use flowrun_types::workflow::{StepKind, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure in a definition source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - The workflow ID is non-empty
/// - At least one step exists
/// - All step IDs are non-empty and unique
/// - No two steps map to the same output artifact name
/// - Agent steps name an agent
/// - `on_fail.retry_step` references point to existing step IDs
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(format!(
            "workflow '{}' must have at least one step",
            def.id
        )));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(DefinitionError::Validation(format!(
                "workflow '{}' has a step with an empty id",
                def.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    let mut artifact_names = HashMap::new();
    for step in &def.steps {
        let name = step_output_file_name(&step.id);
        if let Some(other) = artifact_names.insert(name.clone(), step.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "steps '{other}' and '{}' share the output file name '{name}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        if step.kind == StepKind::Agent
            && step.agent.as_deref().is_none_or(|a| a.trim().is_empty())
        {
            return Err(DefinitionError::Validation(format!(
                "agent step '{}' does not name an agent",
                step.id
            )));
        }

        let target = step.on_fail.as_ref().and_then(|p| p.retry_step.as_deref());
        if let Some(target) = target {
            if !seen_ids.contains(target) {
                return Err(DefinitionError::Validation(format!(
                    "step '{}' redirects to unknown step '{}'",
                    step.id, target
                )));
            }
        }
    }

    Ok(())
}

/// File name of a step's output artifact.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` and leading dots are
/// dropped, so the name never leaves the run's output directory.
pub fn step_output_file_name(step_id: &str) -> String {
    let replaced: String = step_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match replaced.trim_start_matches('.') {
        "" => "step-output.md".to_string(),
        stem => format!("{stem}.md"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
