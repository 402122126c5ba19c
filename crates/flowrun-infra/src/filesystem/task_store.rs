//! Task payloads stored as `{data_dir}/tasks/<id>.json`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use flowrun_core::service::{TaskError, TaskSource};
use serde_json::Value;

use super::{read_optional, sanitize_file_name};

#[derive(Debug, Clone)]
pub struct FileTaskSource {
    tasks_dir: PathBuf,
}

impl FileTaskSource {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    async fn load(&self, task_id: &str) -> Result<Option<Value>, TaskError> {
        // IDs that are not a plain file name cannot name a stored task.
        if sanitize_file_name(task_id).as_deref() != Some(task_id) {
            tracing::debug!(task_id, "task ID is not a valid file name");
            return Ok(None);
        }

        let path = self.tasks_dir.join(format!("{task_id}.json"));
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| TaskError::Malformed {
                task_id: task_id.to_string(),
                reason: err.to_string(),
            })
    }
}

impl TaskSource for FileTaskSource {
    fn get_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, TaskError>> + Send + 'a>> {
        Box::pin(self.load(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn source() -> (TempDir, FileTaskSource) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tasks");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("T-42.json"),
            r#"{"id": "T-42", "title": "Add login", "labels": ["auth"]}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("broken.json"), "{ nope").await.unwrap();
        (tmp, FileTaskSource::new(dir))
    }

    #[tokio::test]
    async fn test_get_task_returns_payload() {
        let (_tmp, source) = source().await;
        let task = source.get_task("T-42").await.unwrap().unwrap();
        assert_eq!(task["title"], json!("Add login"));
        assert_eq!(task["labels"][0], json!("auth"));
    }

    #[tokio::test]
    async fn test_missing_and_unsafe_ids_are_none() {
        let (_tmp, source) = source().await;
        assert!(source.get_task("T-99").await.unwrap().is_none());
        assert!(source.get_task("../T-42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_task_is_an_error() {
        let (_tmp, source) = source().await;
        let err = source.get_task("broken").await.unwrap_err();
        assert!(matches!(err, TaskError::Malformed { ref task_id, .. } if task_id == "broken"));
    }
}
