//! Agent executor port.
//!
//! The engine never decides what an agent does: it renders a prompt and
//! hands it to an `AgentExecutor`, which returns raw text. Follows the same
//! blanket-impl pattern as the other dynamic ports:
//! 1. `AgentExecutor` uses RPITIT
//! 2. `AgentExecutorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxAgentExecutor` wraps `Arc<dyn AgentExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flowrun_types::run::RunId;
use flowrun_types::workflow::{SessionMode, WorkflowAgent};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything an executor needs to run one agent step.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub run_id: RunId,
    pub step_id: String,
    pub agent_id: String,
    /// The rendered step input.
    pub prompt: String,
    pub task_id: Option<String>,
    pub session_mode: SessionMode,
    /// Roster entry for `agent_id`, when the definition has one.
    pub agent: Option<WorkflowAgent>,
}

/// Errors raised by agent executors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to launch agent: {0}")]
    Launch(String),

    #[error("agent exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("agent timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Runs an agent with a prompt and returns its raw text output.
///
/// Timeouts are the executor's responsibility.
pub trait AgentExecutor: Send + Sync {
    fn invoke(
        &self,
        invocation: &AgentInvocation,
    ) -> impl Future<Output = Result<String, AgentError>> + Send;
}

/// Object-safe version of [`AgentExecutor`] with boxed futures.
pub trait AgentExecutorDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<String, AgentError>> + Send + 'a>>;
}

impl<T: AgentExecutor> AgentExecutorDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<String, AgentError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation))
    }
}

/// Type-erased agent executor for runtime selection (echo vs command).
#[derive(Clone)]
pub struct BoxAgentExecutor {
    inner: Arc<dyn AgentExecutorDyn>,
}

impl BoxAgentExecutor {
    pub fn new<T: AgentExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
        self.inner.invoke_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxAgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentExecutor").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Echo executor
// ---------------------------------------------------------------------------

/// Deterministic executor that echoes the prompt back.
///
/// Used when no agent command is configured. Its output always contains
/// `STATUS: done`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAgentExecutor;

impl AgentExecutor for EchoAgentExecutor {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
        tracing::debug!(
            run_id = %invocation.run_id,
            step_id = %invocation.step_id,
            agent = %invocation.agent_id,
            session_mode = %invocation.session_mode,
            "echo agent invoked"
        );
        Ok(format!(
            "Agent {} executed step {}\n\nPrompt:\n{}\n\nSTATUS: done\nOUTPUT: Placeholder result",
            invocation.agent_id, invocation.step_id, invocation.prompt
        ))
    }
}
