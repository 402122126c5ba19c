//! Step output parsing and acceptance checks.
//!
//! The output file hint selects the parser: `.yml`/`.yaml` parse as YAML,
//! `.json` as JSON, anything else keeps the raw text. A parse failure is not
//! a step failure; the raw text is kept instead.

use std::path::Path;

use serde_json::Value;

/// How a step's raw output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
    Text,
}

impl OutputFormat {
    /// Pick a format from an output file hint such as `plan.yml`.
    pub fn from_file_hint(file: Option<&str>) -> Self {
        let extension = file
            .and_then(|f| Path::new(f).extension())
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yml") | Some("yaml") => OutputFormat::Yaml,
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Parse raw agent output according to `format`.
pub fn parse_output(step_id: &str, raw: &str, format: OutputFormat) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }

    let parsed = match format {
        OutputFormat::Text => return Value::String(raw.to_string()),
        OutputFormat::Yaml => serde_yaml_ng::from_str::<Value>(raw).map_err(|e| e.to_string()),
        OutputFormat::Json => serde_json::from_str::<Value>(raw).map_err(|e| e.to_string()),
    };

    match parsed {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                step_id,
                ?format,
                error = %error,
                "failed to parse step output as structured data, keeping raw text"
            );
            Value::String(raw.to_string())
        }
    }
}

/// The first acceptance criterion that is not a literal substring of `raw`.
pub fn first_unmet_criterion<'a>(raw: &str, criteria: &'a [String]) -> Option<&'a str> {
    criteria
        .iter()
        .find(|criterion| !raw.contains(criterion.as_str()))
        .map(String::as_str)
}
