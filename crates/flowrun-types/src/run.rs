//! Run-time state for flowrun workflow runs.
//!
//! A `WorkflowRun` is the mutable execution record of one definition. It owns
//! one `StepRun` per definition step (created eagerly, in definition order)
//! and a `RunContext` that accumulates variables and step outputs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RunIdError;

// ---------------------------------------------------------------------------
// Run ID
// ---------------------------------------------------------------------------

/// Length of the random suffix in generated run IDs.
const RUN_ID_SUFFIX_LEN: usize = 10;

/// Minimum number of timestamp digits accepted when parsing a run ID.
const RUN_ID_MIN_DIGITS: usize = 10;

/// Minimum length of the opaque suffix accepted when parsing a run ID.
const RUN_ID_MIN_SUFFIX: usize = 6;

/// Globally unique run identifier of the form `run_<unix-millis>_<suffix>`.
///
/// The leading timestamp makes IDs sort by creation time. Every ID that
/// reaches the filesystem has passed [`RunId::parse`], so it can be used as a
/// directory name directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run ID from the current time and a UUIDv7 suffix.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let uuid = Uuid::now_v7().simple().to_string();
        // The tail of a v7 UUID is random; the head is the timestamp again.
        let suffix = &uuid[uuid.len() - RUN_ID_SUFFIX_LEN..];
        Self(format!("run_{millis}_{suffix}"))
    }

    /// Validate an externally supplied run ID.
    pub fn parse(raw: &str) -> Result<Self, RunIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RunIdError::Empty);
        }
        if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains("..") {
            return Err(RunIdError::IllegalPath(trimmed.to_string()));
        }
        if !has_run_id_shape(trimmed) {
            return Err(RunIdError::BadFormat(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn has_run_id_shape(raw: &str) -> bool {
    let Some(rest) = raw.strip_prefix("run_") else {
        return false;
    };
    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits < RUN_ID_MIN_DIGITS {
        return false;
    }
    let Some(suffix) = rest[digits..].strip_prefix('_') else {
        return false;
    };
    suffix.len() >= RUN_ID_MIN_SUFFIX
        && suffix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = RunIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Paused awaiting `resume_run`.
    Blocked,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Completed and failed runs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "blocked" => Ok(RunStatus::Blocked),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Settled steps are not executed again by the same run.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run Context
// ---------------------------------------------------------------------------

/// String-keyed JSON context shared by all steps of a run.
///
/// Serialized as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext(Map<String, Value>);

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Shallow merge; keys in `other` overwrite existing keys.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.0.insert(key, value);
        }
    }

    /// Resolve a dot path such as `task.title` or `steps.plan.output.files.0`.
    ///
    /// Object segments match keys; array segments must parse as an index.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for RunContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Step Run
// ---------------------------------------------------------------------------

/// Execution record for one definition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub retries: u32,
    /// Redirect-retries this step has triggered via `retry_step`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub redirects: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Reference to the persisted output artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StepRun {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            retries: 0,
            redirects: 0,
            started_at: None,
            completed_at: None,
            duration: None,
            output: None,
            error: None,
        }
    }

    /// Return the step to `pending`, clearing everything from its last attempt.
    /// Counters are left alone.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.duration = None;
        self.output = None;
        self.error = None;
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// The persisted record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: String,
    pub workflow_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: RunStatus,
    pub current_step: String,
    pub context: RunContext,
    pub steps: Vec<StepRun>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn step(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of completed or skipped steps.
    pub fn settled_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_settled()).count()
    }
}

// ---------------------------------------------------------------------------
// Run Filter
// ---------------------------------------------------------------------------

/// Filters for listing runs. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        if let Some(task_id) = &self.task_id {
            if run.task_id.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if &run.workflow_id != workflow_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
