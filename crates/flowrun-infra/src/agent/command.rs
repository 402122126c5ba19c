//! Agent executor that runs an external command per step.
//!
//! The rendered prompt is written to the child's stdin and its stdout is the
//! step's raw output. Invocation metadata is passed through environment
//! variables so wrapper scripts can route to the right agent:
//!
//! | Variable                | Value                         |
//! |-------------------------|-------------------------------|
//! | `FLOWRUN_AGENT`         | agent ID                      |
//! | `FLOWRUN_RUN_ID`        | run ID                        |
//! | `FLOWRUN_STEP_ID`       | step ID                       |
//! | `FLOWRUN_TASK_ID`       | task ID (empty when none)     |
//! | `FLOWRUN_SESSION_MODE`  | `fresh` or `reuse`            |
//! | `FLOWRUN_AGENT_MODEL`   | roster model, when configured |

use std::process::Stdio;
use std::time::Duration;

use flowrun_core::service::{AgentError, AgentExecutor, AgentInvocation};
use flowrun_types::config::AgentConfig;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandAgentExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAgentExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from `[agent]` config, or `None` when no command is configured.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self::new(
            program.clone(),
            args.to_vec(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, invocation: &AgentInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FLOWRUN_AGENT", &invocation.agent_id)
            .env("FLOWRUN_RUN_ID", invocation.run_id.as_str())
            .env("FLOWRUN_STEP_ID", &invocation.step_id)
            .env(
                "FLOWRUN_TASK_ID",
                invocation.task_id.as_deref().unwrap_or_default(),
            )
            .env("FLOWRUN_SESSION_MODE", invocation.session_mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = invocation.agent.as_ref().and_then(|a| a.model.as_deref()) {
            cmd.env("FLOWRUN_AGENT_MODEL", model);
        }
        cmd
    }
}

impl AgentExecutor for CommandAgentExecutor {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<String, AgentError> {
        let started = std::time::Instant::now();
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|e| AgentError::Launch(format!("{}: {e}", self.program)))?;

        // Feed stdin from a separate task so a child that writes before it
        // reads cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = invocation.prompt.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    if err.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::debug!(error = %err, "failed to write prompt to agent stdin");
                    }
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    run_id = %invocation.run_id,
                    step_id = %invocation.step_id,
                    timeout_secs = self.timeout.as_secs(),
                    "agent command timed out"
                );
                return Err(AgentError::TimedOut {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(AgentError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(
            run_id = %invocation.run_id,
            step_id = %invocation.step_id,
            agent = %invocation.agent_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent command finished"
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
