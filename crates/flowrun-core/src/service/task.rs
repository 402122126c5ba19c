//! Task source port.
//!
//! A task is an opaque JSON payload placed under `context.task` when a run is
//! started for it. Object-safe so the orchestrator can hold it optionally.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task source I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task '{task_id}' is not valid JSON: {reason}")]
    Malformed { task_id: String, reason: String },
}

pub trait TaskSource: Send + Sync {
    /// Load a task payload by ID, or `None` when the task does not exist.
    fn get_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, TaskError>> + Send + 'a>>;
}
