//! Workflow definition types for flowrun.
//!
//! A `WorkflowDefinition` is the immutable, declarative description of a
//! workflow: an ordered list of steps, a variable map merged into every run's
//! context, and an agent roster. Definitions are authored as YAML and are
//! snapshotted next to each run so later edits never change an in-flight run.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition, identified by `id` + `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g. "feature-dev").
    pub id: String,
    /// Definition version. Numeric YAML versions are accepted and stored as text.
    #[serde(
        default = "default_version",
        deserialize_with = "deserialize_version"
    )]
    pub version: String,
    /// Human-readable workflow name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Variables merged into every run's initial context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Agents referenced by steps, with per-agent settings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<WorkflowAgent>,
    /// Ordered steps. Execution follows this order.
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> String {
    "1".to_string()
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Integer(u64),
        Float(f64),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(text) => text,
        RawVersion::Integer(n) => n.to_string(),
        RawVersion::Float(f) => f.to_string(),
    })
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Position of a step in definition order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Look up an agent in the roster by ID.
    pub fn agent(&self, agent_id: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }
}

/// An entry in the workflow's agent roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAgent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Any other agent settings, passed through untouched.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within the definition (e.g. "plan").
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Prompt template; `{{dot.path}}` tokens are resolved against the run context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Agent ID from the roster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutputSpec>,
    /// Literal substrings that must all appear in the raw agent output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FailurePolicy>,
    /// Named session to reuse across steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fresh_session: Option<bool>,
}

impl WorkflowStep {
    /// Resolve the session hint: `reuse` when a session is named or
    /// `fresh_session` is explicitly false, otherwise `fresh`.
    pub fn session_mode(&self) -> SessionMode {
        if self.session.is_some() || self.fresh_session == Some(false) {
            SessionMode::Reuse
        } else {
            SessionMode::Fresh
        }
    }

    /// The output file hint, if any.
    pub fn output_file(&self) -> Option<&str> {
        self.output.as_ref().and_then(|o| o.file.as_deref())
    }
}

/// The kind of step. Only `Agent` is executable; the other kinds are
/// recognised so they can be rejected with a precise error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    Loop,
    Gate,
    Parallel,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Agent => "agent",
            StepKind::Loop => "loop",
            StepKind::Gate => "gate",
            StepKind::Parallel => "parallel",
        }
    }

    pub fn is_implemented(&self) -> bool {
        matches!(self, StepKind::Agent)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output hints for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutputSpec {
    /// File name whose extension selects the parser (`.yml`, `.yaml`, `.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Session-reuse hint passed to the agent executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Fresh,
    Reuse,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Fresh => "fresh",
            SessionMode::Reuse => "reuse",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure Policy
// ---------------------------------------------------------------------------

/// What to do when a step fails. Rules are evaluated in field order:
/// `retry`, `retry_step`, then `escalate_to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Number of same-step retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// Step to re-run from when this step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<EscalationTarget>,
    /// Message recorded on the run when escalating to a human.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_message: Option<String>,
}

/// Escalation target, written as `human`, `skip` or `agent:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EscalationTarget {
    Human,
    Skip,
    Agent(String),
}

impl TryFrom<String> for EscalationTarget {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.trim() {
            "human" => Ok(EscalationTarget::Human),
            "skip" => Ok(EscalationTarget::Skip),
            other => match other.strip_prefix("agent:") {
                Some(agent) if !agent.trim().is_empty() => {
                    Ok(EscalationTarget::Agent(agent.trim().to_string()))
                }
                _ => Err(format!(
                    "invalid escalate_to '{other}' (expected 'human', 'skip' or 'agent:<id>')"
                )),
            },
        }
    }
}

impl From<EscalationTarget> for String {
    fn from(target: EscalationTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for EscalationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationTarget::Human => f.write_str("human"),
            EscalationTarget::Skip => f.write_str("skip"),
            EscalationTarget::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FEATURE_DEV_YAML: &str = r#"
id: feature-dev
version: 2
name: Feature development
variables:
  repo: veritas-kanban
  max_files: 20
agents:
  - id: planner
    model: claude-sonnet
    tools: [read, grep]
    temperature: 0.2
  - id: developer
steps:
  - id: plan
    type: agent
    agent: planner
    input: "Plan {{task.title}} in {{repo}}"
    output:
      file: plan.yml
    acceptance_criteria: ["STATUS: done"]
    on_fail:
      retry: 2
  - id: implement
    type: agent
    agent: developer
    session: dev
    input: "Implement {{steps.plan.output}}"
    on_fail:
      retry_step: plan
      escalate_to: human
      escalate_message: Implementation needs review
  - id: review
    type: gate
"#;

    #[test]
    fn test_parse_realistic_yaml_definition() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(FEATURE_DEV_YAML).unwrap();
        assert_eq!(def.id, "feature-dev");
        assert_eq!(def.version, "2");
        assert_eq!(def.variables["repo"], Value::from("veritas-kanban"));
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[2].kind, StepKind::Gate);

        let plan = def.step("plan").unwrap();
        assert_eq!(plan.output_file(), Some("plan.yml"));
        assert_eq!(plan.on_fail.as_ref().unwrap().retry, Some(2));

        let implement = def.step("implement").unwrap();
        let policy = implement.on_fail.as_ref().unwrap();
        assert_eq!(policy.retry_step.as_deref(), Some("plan"));
        assert_eq!(policy.escalate_to, Some(EscalationTarget::Human));
    }

    #[test]
    fn test_agent_roster_keeps_extra_settings() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(FEATURE_DEV_YAML).unwrap();
        let planner = def.agent("planner").unwrap();
        assert_eq!(planner.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(planner.tools, vec!["read", "grep"]);
        assert_eq!(planner.settings["temperature"], Value::from(0.2));
        assert!(def.agent("unknown").is_none());
    }

    #[test]
    fn test_version_accepts_text() {
        let yaml = "id: wf\nversion: \"1.4.0\"\nsteps: []\n";
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, "1.4.0");

        let yaml = "id: wf\nsteps: []\n";
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, "1");
    }

    #[test]
    fn test_unknown_step_type_is_rejected() {
        let yaml = "id: wf\nsteps:\n  - id: a\n    type: teleport\n";
        let result: Result<WorkflowDefinition, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_mode_resolution() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(FEATURE_DEV_YAML).unwrap();
        assert_eq!(def.steps[0].session_mode(), SessionMode::Fresh);
        assert_eq!(def.steps[1].session_mode(), SessionMode::Reuse);

        let mut step = def.steps[0].clone();
        step.fresh_session = Some(false);
        assert_eq!(step.session_mode(), SessionMode::Reuse);
        step.fresh_session = Some(true);
        assert_eq!(step.session_mode(), SessionMode::Fresh);
    }

    #[test]
    fn test_escalation_target_parsing() {
        assert_eq!(
            EscalationTarget::try_from("skip".to_string()),
            Ok(EscalationTarget::Skip)
        );
        assert_eq!(
            EscalationTarget::try_from("agent:reviewer".to_string()),
            Ok(EscalationTarget::Agent("reviewer".to_string()))
        );
        assert!(EscalationTarget::try_from("agent:".to_string()).is_err());
        assert!(EscalationTarget::try_from("nobody".to_string()).is_err());

        let json = serde_json::to_string(&EscalationTarget::Agent("qa".to_string())).unwrap();
        assert_eq!(json, "\"agent:qa\"");
    }

    #[test]
    fn test_step_indexing() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(FEATURE_DEV_YAML).unwrap();
        assert_eq!(def.step_index("plan"), Some(0));
        assert_eq!(def.step_index("review"), Some(2));
        assert_eq!(def.step_index("deploy"), None);
        assert!(StepKind::Agent.is_implemented());
        assert!(!StepKind::Parallel.is_implemented());
    }
}
