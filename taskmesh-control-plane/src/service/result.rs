//! Result ingestion from the worker agent's `POST /tasks/{id}/result` (§4.2,
//! §4.7 step 9). Idempotent on `task_id`: a second POST for an
//! already-terminal task is a no-op rather than an error (§8 property 4),
//! since a worker may retry the POST after a dropped response.

use crate::repo::{ExecutionRepo, TaskRepo, WorkerRepo};
use crate::service::aggregator::PlanAggregator;
use crate::service::dispatcher::Dispatcher;
use serde_json::Value as Json;
use taskmesh_common::ids::TaskId;
use taskmesh_common::model::{ExecutionState, TaskOutcome, TaskState};
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("aggregation failed: {0}")]
    Aggregate(#[from] crate::service::aggregator::AggregatorError),
    #[error("dispatch after result failed: {0}")]
    Dispatch(#[from] crate::service::dispatcher::DispatchError),
}

impl SafeDisplay for ResultError {
    fn to_safe_string(&self) -> String {
        match self {
            ResultError::NotFound(_) => "task not found".to_string(),
            _ => "result ingestion failed".to_string(),
        }
    }
}

pub struct TaskResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub result: Json,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ResultHandler {
    executions: ExecutionRepo,
    tasks: TaskRepo,
    workers: WorkerRepo,
    aggregator: PlanAggregator,
    dispatcher: Dispatcher,
}

impl ResultHandler {
    pub fn new(
        executions: ExecutionRepo,
        tasks: TaskRepo,
        workers: WorkerRepo,
        aggregator: PlanAggregator,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            executions,
            tasks,
            workers,
            aggregator,
            dispatcher,
        }
    }

    /// §4.2: records the task's terminal state and result, mirrors it onto
    /// the owning execution, frees the worker's slot, recomputes the parent
    /// plan if any, then nudges the dispatcher so a freed worker or an
    /// unblocked sequential sibling gets picked up immediately.
    pub async fn record(&self, incoming: TaskResult) -> Result<(), ResultError> {
        let task = self
            .tasks
            .find(incoming.task_id)
            .await?
            .ok_or(ResultError::NotFound(incoming.task_id))?;

        if task.state.is_terminal() {
            info!(task_id = %incoming.task_id, "duplicate result for terminal task, ignoring");
            return Ok(());
        }

        let task_state = match incoming.outcome {
            TaskOutcome::Completed => TaskState::Completed,
            TaskOutcome::Failed => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        };
        self.tasks.set_state(None, task.id, task_state).await?;
        if let Some(error) = &incoming.error {
            self.tasks.set_error(task.id, error).await?;
        }

        if let Some(worker_id) = task.worker_ref {
            self.workers.adjust_current_tasks(worker_id, -1).await?;
        }

        if let Some(execution) = self.executions.find(task.execution_ref).await? {
            if !execution.state.is_terminal() {
                let execution_state = ExecutionState::from(incoming.outcome);
                self.executions.set_state(None, execution.id, execution_state).await?;
                self.executions.set_result(execution.id, incoming.result.clone()).await?;

                if let Some(parent) = execution.parent {
                    self.aggregator.recompute(parent).await?;
                }
            }
        }

        info!(task_id = %task.id, outcome = ?incoming.outcome, "task result recorded");

        self.dispatcher.dispatch(50).await?;
        Ok(())
    }
}
