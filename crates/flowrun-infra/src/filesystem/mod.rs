//! Filesystem adapters for flowrun.
//!
//! Implements the run store, definition source and task source ports from
//! `flowrun-core` on top of a data directory:
//!
//! ```text
//! <data_dir>/config.toml
//! <data_dir>/workflows/<id>.yml | <id>.yaml
//! <data_dir>/tasks/<id>.json
//! <data_dir>/runs/<run_id>/...
//! ```

pub mod definition_store;
pub mod run_store;
pub mod task_store;

use std::path::{Path, PathBuf};

pub use definition_store::FileDefinitionStore;
pub use run_store::FileRunStore;
pub use task_store::FileTaskSource;

/// Compute the workflow definitions directory: `{data_dir}/workflows/`.
pub fn workflows_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workflows")
}

/// Compute the task payload directory: `{data_dir}/tasks/`.
pub fn tasks_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("tasks")
}

/// Compute the run directory root: `{data_dir}/runs/`.
pub fn runs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("runs")
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `FLOWRUN_DATA_DIR` environment variable
/// 2. `~/.flowrun`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWRUN_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".flowrun");
    }

    // Last resort: current directory
    PathBuf::from(".flowrun")
}

/// Reduce `name` to a safe single path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` and leading dots are
/// stripped. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stripped = replaced.trim_start_matches('.');
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Write `contents` to `path` via a sibling temp file and a rename, so
/// readers see either the old or the new document.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::now_v7().simple()));

    if let Err(err) = tokio::fs::write(&tmp_path, contents).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    Ok(())
}

/// Read a UTF-8 file, mapping "not found" to `None`.
pub async fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
