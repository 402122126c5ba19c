//! Event types for the flowrun run event bus.
//!
//! `RunEvent` is broadcast after every persisted run state change. Each event
//! carries a full snapshot of the run as it was written to the store.

use serde::{Deserialize, Serialize};

use crate::run::{RunId, WorkflowRun};

/// Run lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run was persisted and its loop is about to start.
    RunStarted { run: WorkflowRun },

    /// A blocked run was moved back to running.
    RunResumed { run: WorkflowRun },

    /// `current_step` moved to a new step.
    StepStarted { step_id: String, run: WorkflowRun },

    StepCompleted { step_id: String, run: WorkflowRun },

    /// A step attempt failed. Failure policy has not been applied yet.
    StepFailed { step_id: String, run: WorkflowRun },

    /// The run paused awaiting a human.
    RunBlocked { run: WorkflowRun },

    RunCompleted { run: WorkflowRun },

    RunFailed { run: WorkflowRun },
}

impl RunEvent {
    /// The run snapshot carried by the event.
    pub fn run(&self) -> &WorkflowRun {
        match self {
            RunEvent::RunStarted { run }
            | RunEvent::RunResumed { run }
            | RunEvent::StepStarted { run, .. }
            | RunEvent::StepCompleted { run, .. }
            | RunEvent::StepFailed { run, .. }
            | RunEvent::RunBlocked { run }
            | RunEvent::RunCompleted { run }
            | RunEvent::RunFailed { run } => run,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run().id
    }

    /// The step the event is about, for step-level events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            RunEvent::StepStarted { step_id, .. }
            | RunEvent::StepCompleted { step_id, .. }
            | RunEvent::StepFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Short snake_case name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::RunResumed { .. } => "run_resumed",
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepCompleted { .. } => "step_completed",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::RunBlocked { .. } => "run_blocked",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }

    /// True for events after which the run loop has stopped.
    pub fn ends_loop(&self) -> bool {
        matches!(
            self,
            RunEvent::RunBlocked { .. } | RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. }
        )
    }
}
