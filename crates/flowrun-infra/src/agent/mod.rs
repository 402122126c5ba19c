//! Agent executor adapters.

pub mod command;

use flowrun_core::service::{BoxAgentExecutor, EchoAgentExecutor};
use flowrun_types::config::AgentConfig;

pub use command::CommandAgentExecutor;

/// Pick the executor for `config`: the configured command, or the echo
/// executor when none is set.
pub fn select_agent_executor(config: &AgentConfig) -> BoxAgentExecutor {
    match CommandAgentExecutor::from_config(config) {
        Some(executor) => {
            tracing::info!(program = executor.program(), "using command agent executor");
            BoxAgentExecutor::new(executor)
        }
        None => {
            tracing::info!("no agent command configured, using echo executor");
            BoxAgentExecutor::new(EchoAgentExecutor)
        }
    }
}
