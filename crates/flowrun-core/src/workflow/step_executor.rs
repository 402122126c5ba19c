//! Step executor: runs one step against the current run context.
//!
//! `StepExecutor` dispatches on `StepKind`. Only agent steps execute; the
//! reserved kinds fail with `UnsupportedStepType`. An agent step renders its
//! input, invokes the agent, parses and checks the output, then persists the
//! raw output as an artifact and appends it to the run's progress log.

use chrono::{SecondsFormat, Utc};
use flowrun_types::error::StoreError;
use flowrun_types::run::WorkflowRun;
use flowrun_types::workflow::{StepKind, WorkflowDefinition, WorkflowStep};
use serde_json::Value;

use crate::repository::{ProgressAppend, RunStore};
use crate::service::agent::{AgentError, AgentInvocation, BoxAgentExecutor};

use super::context::{build_execution_context, render_template};
use super::output::{OutputFormat, first_unmet_criterion, parse_output};

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Output from a successful step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Parsed output, merged into the run context under the step ID.
    pub output: Value,
    /// Reference to the persisted raw output.
    pub output_ref: String,
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{kind} steps are not implemented (step '{step_id}')")]
    UnsupportedStepType { step_id: String, kind: StepKind },

    #[error("acceptance criterion not met: \"{criterion}\"")]
    AcceptanceCriterion { criterion: String },

    #[error("agent step '{step_id}' does not name an agent")]
    MissingAgent { step_id: String },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual workflow steps.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    agents: BoxAgentExecutor,
}

impl StepExecutor {
    pub fn new(agents: BoxAgentExecutor) -> Self {
        Self { agents }
    }

    /// Run a step and return its parsed output and artifact reference.
    pub async fn execute<S: RunStore>(
        &self,
        store: &S,
        step: &WorkflowStep,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<StepResult, StepError> {
        match step.kind {
            StepKind::Agent => self.execute_agent(store, step, run, definition).await,
            kind @ (StepKind::Loop | StepKind::Gate | StepKind::Parallel) => {
                Err(StepError::UnsupportedStepType {
                    step_id: step.id.clone(),
                    kind,
                })
            }
        }
    }

    async fn execute_agent<S: RunStore>(
        &self,
        store: &S,
        step: &WorkflowStep,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<StepResult, StepError> {
        let agent_id = step
            .agent
            .clone()
            .ok_or_else(|| StepError::MissingAgent {
                step_id: step.id.clone(),
            })?;

        let progress = store.load_progress(&run.id).await?;
        let ctx = build_execution_context(run, progress);
        let prompt = render_template(step.input.as_deref().unwrap_or_default(), &ctx);

        let invocation = AgentInvocation {
            run_id: run.id.clone(),
            step_id: step.id.clone(),
            agent: definition.agent(&agent_id).cloned(),
            agent_id,
            prompt,
            task_id: run.task_id.clone(),
            session_mode: step.session_mode(),
        };

        tracing::info!(
            run_id = %run.id,
            step_id = %step.id,
            agent = %invocation.agent_id,
            session_mode = %invocation.session_mode,
            "executing agent step"
        );

        let raw = self.agents.invoke(&invocation).await?;

        let output = parse_output(
            &step.id,
            &raw,
            OutputFormat::from_file_hint(step.output_file()),
        );

        if let Some(criterion) = first_unmet_criterion(&raw, &step.acceptance_criteria) {
            return Err(StepError::AcceptanceCriterion {
                criterion: criterion.to_string(),
            });
        }
        if !step.acceptance_criteria.is_empty() {
            tracing::debug!(
                step_id = %step.id,
                criteria = step.acceptance_criteria.len(),
                "all acceptance criteria passed"
            );
        }

        let output_ref = store.save_step_output(&run.id, &step.id, &raw).await?;

        let entry = progress_entry(&step.id, &raw);
        if let ProgressAppend::SkippedLimit { size } =
            store.append_progress(&run.id, &entry).await?
        {
            tracing::warn!(
                run_id = %run.id,
                step_id = %step.id,
                size,
                "progress log exceeds size limit, skipping append"
            );
        }

        Ok(StepResult { output, output_ref })
    }
}

/// A timestamped progress log entry for one step.
fn progress_entry(step_id: &str, raw: &str) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("## Step: {step_id} ({timestamp})\n\n{raw}\n\n---\n\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
