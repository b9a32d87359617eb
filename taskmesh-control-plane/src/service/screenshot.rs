//! `POST /tasks/{id}/screenshot` (§6): stores the uploaded image under the
//! media root and merges its path into the owning execution's `result`
//! blob, rather than keeping the bytes in the database.

use crate::repo::{ExecutionRepo, TaskRepo};
use base64::Engine;
use serde_json::json;
use std::path::PathBuf;
use taskmesh_common::ids::TaskId;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ScreenshotError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("image data was not valid base64")]
    InvalidImageData,
    #[error("failed to write screenshot to disk: {0}")]
    Io(#[from] std::io::Error),
}

impl SafeDisplay for ScreenshotError {
    fn to_safe_string(&self) -> String {
        match self {
            ScreenshotError::NotFound(_) => "task not found".to_string(),
            ScreenshotError::InvalidImageData => "invalid image data".to_string(),
            _ => "screenshot upload failed".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ScreenshotService {
    tasks: TaskRepo,
    executions: ExecutionRepo,
    media_root: PathBuf,
}

impl ScreenshotService {
    pub fn new(tasks: TaskRepo, executions: ExecutionRepo, media_root: PathBuf) -> Self {
        Self {
            tasks,
            executions,
            media_root,
        }
    }

    /// Accepts either a raw base64 string or a `data:image/...;base64,`
    /// data URL, as the worker's opaque step executor may hand either.
    pub async fn store(
        &self,
        task_id: TaskId,
        image_data: &str,
        is_failure: bool,
    ) -> Result<String, ScreenshotError> {
        let task = self.tasks.find(task_id).await?.ok_or(ScreenshotError::NotFound(task_id))?;

        let raw_base64 = image_data
            .split_once(";base64,")
            .map(|(_, data)| data)
            .unwrap_or(image_data);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw_base64)
            .map_err(|_| ScreenshotError::InvalidImageData)?;

        let dir = self.media_root.join(task.execution_ref.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let filename = format!("{task_id}-{}.png", nanoid::nanoid!(8));
        let path = dir.join(&filename);
        tokio::fs::write(&path, &bytes).await?;

        let relative_path = path.to_string_lossy().to_string();

        if let Some(execution) = self.executions.find(task.execution_ref).await? {
            let mut result = execution.result.unwrap_or_else(|| json!({}));
            let screenshots = result
                .get_mut("screenshots")
                .and_then(|v| v.as_array_mut())
                .cloned()
                .unwrap_or_default();
            let mut screenshots = screenshots;
            screenshots.push(json!({"path": relative_path, "is_failure": is_failure}));
            result["screenshots"] = json!(screenshots);
            self.executions.set_result(task.execution_ref, result).await?;
        }

        info!(task_id = %task_id, path = %relative_path, is_failure, "screenshot stored");
        Ok(relative_path)
    }
}
