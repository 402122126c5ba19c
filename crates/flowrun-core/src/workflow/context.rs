//! Execution context assembly and `{{dot.path}}` template rendering.
//!
//! Each step sees the run context plus two derived entries: `progress` (the
//! accumulated progress log) and `steps` (output, status and duration of every
//! completed step that has a context entry).

use flowrun_types::run::{RunContext, StepStatus, WorkflowRun};
use serde_json::{Map, Value, json};

/// Build the context a step's input template is rendered against.
pub fn build_execution_context(run: &WorkflowRun, progress: Option<String>) -> RunContext {
    let mut ctx = run.context.clone();

    let mut steps = Map::new();
    for step in &run.steps {
        if step.status != StepStatus::Completed {
            continue;
        }
        if let Some(output) = run.context.get(&step.step_id) {
            steps.insert(
                step.step_id.clone(),
                json!({
                    "output": output,
                    "status": step.status,
                    "duration": step.duration,
                }),
            );
        }
    }

    ctx.insert("progress", Value::String(progress.unwrap_or_default()));
    ctx.insert("steps", Value::Object(steps));
    ctx
}

/// Replace every `{{expr}}` in `template` with the dot-path lookup of the
/// trimmed `expr` in `ctx`.
///
/// Unresolved paths leave the original token untouched. Replacements are not
/// rescanned.
pub fn render_template(template: &str, ctx: &RunContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        // The expression runs up to the first '}', which must start "}}".
        let token = after_open
            .find('}')
            .filter(|&close| close > 0 && after_open[close..].starts_with("}}"))
            .map(|close| (&after_open[..close], open + 2 + close + 2));

        match token {
            Some((expr, end)) => {
                match ctx.lookup(expr.trim()) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => out.push_str(&rest[open..end]),
                }
                rest = &rest[end..];
            }
            None => {
                out.push('{');
                rest = &rest[open + 1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Convert a JSON value to a display string for template rendering.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
