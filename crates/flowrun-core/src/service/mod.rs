//! Collaborator ports consumed by the run engine.
//!
//! Definitions, tasks and agents live outside the engine; the
//! infrastructure layer provides filesystem and process-backed adapters.

pub mod agent;
pub mod definition;
pub mod task;

pub use agent::{AgentError, AgentExecutor, AgentInvocation, BoxAgentExecutor, EchoAgentExecutor};
pub use definition::DefinitionSource;
pub use task::{TaskError, TaskSource};
