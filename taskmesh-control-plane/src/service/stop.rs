//! C6 — the stop controller. Records intent first, then cascades
//! cancellation across pending/assigned/running children (§4.6). No broker
//! message is sent; workers discover the stop on their own pace (§4.6 step 3).

use crate::repo::{ExecutionRepo, TaskRepo, WorkerRepo};
use serde_json::json;
use taskmesh_common::ids::ExecutionId;
use taskmesh_common::model::{ExecutionState, TaskState};
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error("execution {0} not found")]
    NotFound(ExecutionId),
    #[error("execution {0} is already in a terminal state")]
    AlreadyTerminal(ExecutionId),
}

impl SafeDisplay for StopError {
    fn to_safe_string(&self) -> String {
        match self {
            StopError::NotFound(_) => "execution not found".to_string(),
            StopError::AlreadyTerminal(_) => "execution is already finished".to_string(),
            StopError::Repo(_) => "stop failed".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct StopController {
    executions: ExecutionRepo,
    tasks: TaskRepo,
    workers: WorkerRepo,
}

impl StopController {
    pub fn new(executions: ExecutionRepo, tasks: TaskRepo, workers: WorkerRepo) -> Self {
        Self {
            executions,
            tasks,
            workers,
        }
    }

    /// §4.6: valid when the execution is `{pending, running, paused}`.
    /// Single-script stop is the same flow without the children fanout —
    /// `children()` is simply empty for a `script` execution.
    pub async fn stop(&self, execution_id: ExecutionId) -> Result<(), StopError> {
        let execution = self
            .executions
            .find(execution_id)
            .await?
            .ok_or(StopError::NotFound(execution_id))?;

        if !matches!(
            execution.state,
            ExecutionState::Pending | ExecutionState::Running | ExecutionState::Paused
        ) {
            return Err(StopError::AlreadyTerminal(execution_id));
        }

        // Step 1: record intent first. This one write is the authoritative
        // signal every later check (dispatcher, worker status-check,
        // aggregator) reads.
        self.executions.set_state(None, execution_id, ExecutionState::Stopped).await?;
        self.executions
            .set_result(execution_id, json!({"success": false, "message": "user stopped"}))
            .await?;

        // Step 2: cancel children locally.
        let children = self.executions.children(execution_id).await?;
        for child in children {
            if matches!(
                child.state,
                ExecutionState::Pending | ExecutionState::Running | ExecutionState::Paused
            ) {
                self.executions.set_state(None, child.id, ExecutionState::Stopped).await?;
                self.executions
                    .set_result(
                        child.id,
                        json!({"success": false, "message": "user stopped", "stopped_at": chrono::Utc::now()}),
                    )
                    .await?;
            }

            if let Some(task) = self.tasks.find_by_execution(child.id).await? {
                if matches!(task.state, TaskState::Pending | TaskState::Assigned | TaskState::Running) {
                    let had_worker = task.worker_ref;
                    self.tasks.set_state(None, task.id, TaskState::Cancelled).await?;
                    if let Some(worker_id) = had_worker {
                        if matches!(task.state, TaskState::Assigned | TaskState::Running) {
                            self.workers.adjust_current_tasks(worker_id, -1).await?;
                        }
                    }
                }
            }
        }

        info!(execution_id = %execution_id, "execution stopped");
        Ok(())
    }
}
