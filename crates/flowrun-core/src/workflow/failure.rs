//! Failure policy evaluation for failed steps.
//!
//! `resolve` is pure: it picks a `FailureAction` from a step's `on_fail`
//! policy and its counters. `apply` performs the action on the run and the
//! step queue. Rules are evaluated in order and the first match wins:
//!
//! 1. `retry: N` while `retries < N`
//! 2. `retry_step: <id>` while the step has redirected fewer than `max_redirects` times
//! 3. `escalate_to: human`, `skip`, or `agent:<id>`
//! 4. otherwise unhandled

use std::collections::VecDeque;

use flowrun_types::run::{RunStatus, StepRun, StepStatus, WorkflowRun};
use flowrun_types::workflow::{EscalationTarget, FailurePolicy, WorkflowDefinition};
use serde_json::json;
use thiserror::Error;

/// What to do about a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Re-run the same step next.
    Retry,
    /// Rebuild the queue from an earlier (or any) step.
    Redirect { target: String },
    /// Pause the run for a human.
    Block { message: String },
    Skip,
    Unhandled,
}

/// Whether the run loop keeps going after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Continue,
    Blocked,
    Unhandled,
}

/// Policies that name something the engine cannot act on.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("step '{step_id}' redirects to unknown step '{target}'")]
    UnknownRedirectTarget { step_id: String, target: String },

    #[error("escalation to agent '{agent}' is not implemented")]
    AgentEscalation { agent: String },
}

/// Pick the action for a failed step.
pub fn resolve(
    policy: Option<&FailurePolicy>,
    step: &StepRun,
    definition: &WorkflowDefinition,
    max_redirects: u32,
) -> Result<FailureAction, PolicyError> {
    let Some(policy) = policy else {
        return Ok(FailureAction::Unhandled);
    };

    if let Some(limit) = policy.retry {
        if step.retries < limit {
            return Ok(FailureAction::Retry);
        }
    }

    if let Some(target) = &policy.retry_step {
        if step.redirects < max_redirects {
            if definition.step(target).is_none() {
                return Err(PolicyError::UnknownRedirectTarget {
                    step_id: step.step_id.clone(),
                    target: target.clone(),
                });
            }
            return Ok(FailureAction::Redirect {
                target: target.clone(),
            });
        }
    }

    match &policy.escalate_to {
        Some(EscalationTarget::Human) => Ok(FailureAction::Block {
            message: policy
                .escalate_message
                .clone()
                .unwrap_or_else(|| format!("Step {} failed", step.step_id)),
        }),
        Some(EscalationTarget::Skip) => Ok(FailureAction::Skip),
        Some(EscalationTarget::Agent(agent)) => Err(PolicyError::AgentEscalation {
            agent: agent.clone(),
        }),
        None => Ok(FailureAction::Unhandled),
    }
}

/// Apply `action` for the failed step `step_id`.
///
/// A redirect invalidates every step from the target through the failing
/// step so the rebuilt queue re-executes them against fresh outputs. Only
/// the target's retry counter is reset.
pub fn apply(
    action: FailureAction,
    run: &mut WorkflowRun,
    queue: &mut VecDeque<String>,
    definition: &WorkflowDefinition,
    step_id: &str,
    error: &str,
) -> FailureOutcome {
    match action {
        FailureAction::Retry => {
            let mut attempt = 0;
            if let Some(step) = run.step_mut(step_id) {
                step.retries += 1;
                step.reset();
                attempt = step.retries;
            }
            tracing::info!(run_id = %run.id, step_id, attempt, "retrying step");
            queue.push_front(step_id.to_string());
            FailureOutcome::Continue
        }
        FailureAction::Redirect { target } => {
            let target_index = definition.step_index(&target).unwrap_or(0);
            let failed_index = definition.step_index(step_id).unwrap_or(target_index);

            let retries = match run.step_mut(step_id) {
                Some(failed) => {
                    failed.redirects += 1;
                    failed.retries
                }
                None => 0,
            };

            for def_step in &definition.steps[target_index..=failed_index.max(target_index)] {
                if let Some(step) = run.step_mut(&def_step.id) {
                    step.reset();
                    if def_step.id == target {
                        step.retries = 0;
                    }
                }
            }

            queue.clear();
            queue.extend(definition.steps[target_index..].iter().map(|s| s.id.clone()));

            run.context.insert(
                "_retryContext",
                json!({
                    "failedStep": step_id,
                    "error": error,
                    "retries": retries,
                }),
            );

            tracing::info!(
                run_id = %run.id,
                failed_step = step_id,
                retry_step = %target,
                "routing to retry step"
            );
            FailureOutcome::Continue
        }
        FailureAction::Block { message } => {
            run.status = RunStatus::Blocked;
            run.error = Some(message);
            FailureOutcome::Blocked
        }
        FailureAction::Skip => {
            if let Some(step) = run.step_mut(step_id) {
                step.status = StepStatus::Skipped;
            }
            tracing::info!(run_id = %run.id, step_id, "skipping failed step");
            FailureOutcome::Continue
        }
        FailureAction::Unhandled => FailureOutcome::Unhandled,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
