//! C3 — the dispatcher. Scans pending tasks, enforces plan-sequential
//! ordering, picks a worker, publishes, and updates state. Called on task
//! creation, on every worker result POST, and from a periodic tick (§4.1).

use crate::model::{Task, Worker};
use crate::repo::{ExecutionRepo, TaskRepo, WorkerRepo};
use std::sync::Arc;
use taskmesh_broker::{Broker, PlanScript, ScriptData as WireScriptData, TaskPayload};
use taskmesh_common::clock::Clock;
use taskmesh_common::ids::{ExecutionId, TaskId, WorkerId};
use taskmesh_common::model::{ExecutionState, TaskState, WorkerScope};
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::db::Pool;
use taskmesh_service_base::repo::RepoError;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error("broker error: {0}")]
    Broker(#[from] taskmesh_broker::BrokerError),
    #[error("malformed task payload: {0}")]
    MalformedPayload(String),
}

impl SafeDisplay for DispatchError {
    fn to_safe_string(&self) -> String {
        "dispatch failed".to_string()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    executions: ExecutionRepo,
    tasks: TaskRepo,
    workers: WorkerRepo,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        executions: ExecutionRepo,
        tasks: TaskRepo,
        workers: WorkerRepo,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            executions,
            tasks,
            workers,
            broker,
            clock,
        }
    }

    /// §4.1: one pass over up to `limit` pending tasks, each handled in its
    /// own transaction. Returns how many tasks were bound to a worker.
    pub async fn dispatch(&self, limit: i64) -> Result<u32, DispatchError> {
        let candidates = self.tasks.pending_candidates(limit).await?;
        let mut bound = 0u32;

        for task in candidates {
            if self.dispatch_one(&task).await? {
                bound += 1;
            }
        }

        Ok(bound)
    }

    async fn dispatch_one(&self, task: &Task) -> Result<bool, DispatchError> {
        let parent_execution_id = task
            .payload
            .get("parent_execution_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<ExecutionId>().ok());

        // 2a: parent-stop guard, outside the lock — cheap early exit for the
        // common case of a long-stopped plan's leftover siblings.
        if let Some(parent_id) = parent_execution_id {
            if let Some(parent) = self.executions.find(parent_id).await? {
                if parent.state == ExecutionState::Stopped {
                    self.cancel(task.id).await?;
                    return Ok(false);
                }
            }
        }

        // 2b: sequential gate. Does not cancel — retried on the next tick.
        let mode = task.payload.get("mode").and_then(|v| v.as_str());
        let script_index = task.payload.get("script_index").and_then(|v| v.as_u64());
        if mode == Some("sequential") {
            if let (Some(parent_id), Some(index)) = (parent_execution_id, script_index) {
                if index > 0 {
                    if let Some(sibling) = self.tasks.sibling_by_script_index(parent_id, index as u32 - 1).await? {
                        let sibling_execution = self.executions.find(sibling.execution_ref).await?;
                        let sibling_terminal = sibling_execution
                            .map(|e| e.state.is_terminal())
                            .unwrap_or(false);
                        if !sibling_terminal {
                            debug!(task_id = %task.id, "sequential gate: predecessor still running, skipping");
                            return Ok(false);
                        }
                    }
                }
            }
        }

        // 2c/2d: re-lock, re-check state and stop flags, then try to bind.
        let mut tx = self.pool.raw().begin().await.map_err(RepoError::from)?;

        let locked = self.tasks.find_for_update(&mut tx, task.id).await?;
        let Some(locked) = locked else {
            tx.commit().await.map_err(RepoError::from)?;
            return Ok(false);
        };
        if locked.state != TaskState::Pending {
            tx.commit().await.map_err(RepoError::from)?;
            return Ok(false);
        }

        if let Some(parent_id) = parent_execution_id {
            if let Some(parent) = self.executions.find_for_update(&mut tx, parent_id).await? {
                if parent.state == ExecutionState::Stopped {
                    tx.commit().await.map_err(RepoError::from)?;
                    self.cancel(task.id).await?;
                    return Ok(false);
                }
            }
        }
        if let Some(own_execution) = self.executions.find_for_update(&mut tx, task.execution_ref).await? {
            if own_execution.state == ExecutionState::Stopped {
                tx.commit().await.map_err(RepoError::from)?;
                self.cancel(task.id).await?;
                return Ok(false);
            }
        }

        // 2e: worker selection.
        let project = task
            .payload
            .get("script_data")
            .and_then(|sd| sd.get("project_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let worker = match self.select_worker(project.as_deref()).await? {
            Some(w) => w,
            None => {
                tx.commit().await.map_err(RepoError::from)?;
                return Ok(false);
            }
        };

        // 2f: bind, then publish. A publish failure rolls the bind back.
        self.tasks.bind_to_worker(&mut tx, task.id, worker.id).await?;
        tx.commit().await.map_err(RepoError::from)?;
        self.workers.adjust_current_tasks(worker.id, 1).await?;

        match self.publish(&worker, task).await {
            Ok(()) => {
                info!(task_id = %task.id, worker_id = %worker.id, "dispatched task");
                Ok(true)
            }
            Err(err) => {
                warn!(task_id = %task.id, worker_id = %worker.id, error = %err, "publish failed, rolling back bind");
                self.tasks.unbind(task.id).await?;
                self.workers.adjust_current_tasks(worker.id, -1).await?;
                Ok(false)
            }
        }
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), DispatchError> {
        self.tasks.set_state(None, task_id, TaskState::Cancelled).await?;
        Ok(())
    }

    /// §4.1.1: eligible workers filtered by scope, tie-broken by the live
    /// count of tasks each currently has `running` (the authoritative
    /// figure, preferred over the cached `current_tasks` column per §9's
    /// open-question resolution — see DESIGN.md).
    async fn select_worker(&self, project: Option<&str>) -> Result<Option<Worker>, DispatchError> {
        let eligible = self.workers.eligible().await?;

        let mut candidates: Vec<&Worker> = if let Some(project) = project {
            let mut scoped = Vec::new();
            for w in &eligible {
                if w.scope == WorkerScope::Project
                    && w.bound_projects.iter().any(|p| p.to_string() == project)
                {
                    scoped.push(w);
                }
            }
            if scoped.is_empty() {
                eligible.iter().filter(|w| w.scope == WorkerScope::Global).collect()
            } else {
                scoped
            }
        } else {
            eligible.iter().filter(|w| w.scope == WorkerScope::Global).collect()
        };

        if candidates.is_empty() {
            return Ok(None);
        }

        candidates.sort_by_key(|w| w.id);

        let mut best: Option<(&Worker, i64)> = None;
        for w in candidates {
            let running = self.tasks.count_running_for_worker(w.id).await?;
            match best {
                Some((_, best_running)) if running >= best_running => {}
                _ => best = Some((w, running)),
            }
        }

        Ok(best.map(|(w, _)| w.clone()))
    }

    async fn publish(&self, worker: &Worker, task: &Task) -> Result<(), DispatchError> {
        let payload: TaskPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| DispatchError::MalformedPayload(e.to_string()))?;
        self.broker.publish(worker.id, &payload).await?;
        Ok(())
    }
}

/// Builds the broker wire payload (§6) for a freshly created task, used by
/// [`crate::service::execution::ExecutionService`] when it materializes the
/// task row that the dispatcher will later publish.
pub fn build_payload(
    worker_browser_type: &str,
    task_id: TaskId,
    execution_id: ExecutionId,
    timeout: u64,
    variables: std::collections::HashMap<String, serde_json::Value>,
    script_data: WireScriptData,
    parent_execution_id: Option<ExecutionId>,
    mode: Option<taskmesh_common::model::ExecutionMode>,
    script_index: Option<u32>,
    total_scripts: Option<u32>,
    plan_scripts: Vec<PlanScript>,
) -> TaskPayload {
    TaskPayload {
        task_id,
        execution_id,
        browser_type: worker_browser_type.to_string(),
        timeout,
        variables,
        script_data,
        parent_execution_id,
        mode,
        script_index,
        total_scripts,
        plan_scripts,
    }
}
