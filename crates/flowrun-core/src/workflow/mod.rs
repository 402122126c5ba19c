//! Workflow run engine: definitions, step execution and orchestration.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `context` -- execution context assembly and template rendering
//! - `output` -- output parsing by file hint and acceptance checks
//! - `step_executor` -- runs one step against an agent executor
//! - `failure` -- `on_fail` policy resolution and application
//! - `admission` -- ceiling on concurrently executing run loops
//! - `orchestrator` -- starts, drives and resumes runs

pub mod admission;
pub mod context;
pub mod definition;
pub mod failure;
pub mod orchestrator;
pub mod output;
pub mod step_executor;

pub use admission::AdmissionControl;
pub use orchestrator::{OrchestratorError, RunHandle, RunOrchestrator};
pub use step_executor::{StepError, StepExecutor, StepResult};
