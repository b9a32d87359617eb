//! Task rows (§3). State transitions are serialized by row locks taken by
//! the dispatcher (§4.1.c), the stop controller (§4.6) and the result
//! handler; this repo exposes the primitives they compose, not the
//! transitions themselves.

use crate::model::Task;
use chrono::Utc;
use serde_json::Value as Json;
use sqlx::any::AnyRow;
use sqlx::{Any, FromRow, Row, Transaction};
use taskmesh_common::ids::{ExecutionId, TaskId, WorkerId};
use taskmesh_common::model::{Priority, TaskState};
use taskmesh_service_base::db::Pool;
use taskmesh_service_base::repo::RepoError;

#[derive(Clone)]
pub struct TaskRepo {
    pool: Pool,
}

pub struct NewTask {
    pub id: TaskId,
    pub execution_ref: ExecutionId,
    pub priority: Priority,
    pub payload: Json,
}

impl TaskRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: TaskId) -> Result<Option<Task>, RepoError> {
        let query = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1").bind(id.to_string());
        self.pool.with_ro("task", "find").fetch_optional_as(query).await
    }

    pub async fn find_by_execution(&self, execution_ref: ExecutionId) -> Result<Option<Task>, RepoError> {
        let query = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE execution_ref = $1")
            .bind(execution_ref.to_string());
        self.pool.with_ro("task", "find_by_execution").fetch_optional_as(query).await
    }

    /// Caller supplies `id` because it must already be embedded in the
    /// task's broker payload (`TaskPayload::task_id`) before the row exists.
    pub async fn create(&self, new: NewTask) -> Result<Task, RepoError> {
        let id = new.id;
        let query = sqlx::query(
            "INSERT INTO tasks \
             (id, execution_ref, worker_ref, state, priority, payload, error, \
              assigned_at, started_at, completed_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(id.to_string())
        .bind(new.execution_ref.to_string())
        .bind(None::<String>)
        .bind(TaskState::Pending.to_string())
        .bind(new.priority.to_string())
        .bind(new.payload.to_string())
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(Utc::now().to_rfc3339());

        self.pool.with_rw("task", "create").execute(query).await?;
        self.find(id)
            .await?
            .ok_or_else(|| RepoError::Internal("task vanished immediately after insert".into()))
    }

    /// §4.1: up to `limit` pending tasks, highest priority and oldest first —
    /// the dispatcher's per-tick candidate set.
    pub async fn pending_candidates(&self, limit: i64) -> Result<Vec<Task>, RepoError> {
        let query = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE state = 'pending' \
             ORDER BY \
               CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 \
                             WHEN 'normal' THEN 2 WHEN 'low' THEN 3 END ASC, \
               created_at ASC \
             LIMIT $1",
        )
        .bind(limit);
        self.pool.with_ro("task", "pending_candidates").fetch_all_as(query).await
    }

    /// §4.1.c: the dispatcher's row lock before re-checking state and binding.
    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Any>,
        id: TaskId,
    ) -> Result<Option<Task>, RepoError> {
        let sql = format!(
            "SELECT * FROM tasks WHERE id = $1{}",
            self.pool.backend().for_update()
        );
        let row: Option<AnyRow> = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&mut **tx).await?;
        row.map(|r| Task::from_row(&r)).transpose().map_err(Into::into)
    }

    /// The sibling lookup for §4.1.b's sequential gate: the task whose
    /// payload's `script_index` is one less than `script_index`, scoped to
    /// the same `parent_execution_id`. Payload fields are JSON so this is a
    /// scan rather than an indexed lookup — acceptable at plan sizes this
    /// system targets.
    pub async fn sibling_by_script_index(
        &self,
        parent_execution_id: ExecutionId,
        script_index: u32,
    ) -> Result<Option<Task>, RepoError> {
        let tasks = self.all_for_parent(parent_execution_id).await?;
        Ok(tasks.into_iter().find(|t| {
            t.payload.get("script_index").and_then(|v| v.as_u64()) == Some(script_index as u64)
        }))
    }

    async fn all_for_parent(&self, parent_execution_id: ExecutionId) -> Result<Vec<Task>, RepoError> {
        // payload->>'parent_execution_id' isn't portable across sqlite/postgres
        // through the Any driver, so filter in process instead.
        let query = sqlx::query_as::<_, Task>("SELECT * FROM tasks");
        let all: Vec<Task> = self.pool.with_ro("task", "all_for_parent").fetch_all_as(query).await?;
        Ok(all
            .into_iter()
            .filter(|t| {
                t.payload.get("parent_execution_id").and_then(|v| v.as_str())
                    == Some(parent_execution_id.to_string().as_str())
            })
            .collect())
    }

    pub async fn children_of_parent(&self, parent_execution_id: ExecutionId) -> Result<Vec<Task>, RepoError> {
        self.all_for_parent(parent_execution_id).await
    }

    pub async fn bind_to_worker(
        &self,
        tx: &mut Transaction<'_, Any>,
        id: TaskId,
        worker: WorkerId,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE tasks SET worker_ref = $1, state = 'assigned', assigned_at = $2 WHERE id = $3",
        )
        .bind(worker.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Rolls back a bind when the publish step fails (§4.1.f).
    pub async fn unbind(&self, id: TaskId) -> Result<(), RepoError> {
        let query = sqlx::query(
            "UPDATE tasks SET worker_ref = NULL, state = 'pending', assigned_at = NULL WHERE id = $1",
        )
        .bind(id.to_string());
        self.pool.with_rw("task", "unbind").execute(query).await?;
        Ok(())
    }

    pub async fn set_state(
        &self,
        tx: Option<&mut Transaction<'_, Any>>,
        id: TaskId,
        state: TaskState,
    ) -> Result<(), RepoError> {
        let completed_at = matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
        .then(|| Utc::now().to_rfc3339());
        let started_at = matches!(state, TaskState::Running).then(|| Utc::now().to_rfc3339());

        let sql = "UPDATE tasks SET state = $1, \
                   completed_at = COALESCE($2, completed_at), \
                   started_at = COALESCE($3, started_at) WHERE id = $4";

        match tx {
            Some(tx) => {
                sqlx::query(sql)
                    .bind(state.to_string())
                    .bind(completed_at)
                    .bind(started_at)
                    .bind(id.to_string())
                    .execute(&mut **tx)
                    .await?;
            }
            None => {
                let query = sqlx::query(sql)
                    .bind(state.to_string())
                    .bind(completed_at)
                    .bind(started_at)
                    .bind(id.to_string());
                self.pool.with_rw("task", "set_state").execute(query).await?;
            }
        }
        Ok(())
    }

    pub async fn set_error(&self, id: TaskId, error: &str) -> Result<(), RepoError> {
        let query = sqlx::query("UPDATE tasks SET error = $1 WHERE id = $2")
            .bind(error)
            .bind(id.to_string());
        self.pool.with_rw("task", "set_error").execute(query).await?;
        Ok(())
    }

    /// §10.6 executor redistribute: requeues every task bound to `worker`
    /// that is still `assigned` (never `running` — a task already running
    /// on the worker isn't stuck in the sense the operator tool targets)
    /// back to `pending`, clearing the binding.
    pub async fn requeue_assigned_for_worker(&self, worker: WorkerId) -> Result<u64, RepoError> {
        let query = sqlx::query(
            "UPDATE tasks SET worker_ref = NULL, state = 'pending', assigned_at = NULL \
             WHERE worker_ref = $1 AND state = 'assigned'",
        )
        .bind(worker.to_string());
        let result = self.pool.with_rw("task", "requeue_assigned_for_worker").execute(query).await?;
        Ok(result.rows_affected())
    }

    /// The live aggregate §4.1.1 prefers over the cached `worker.current_tasks`
    /// column: how many tasks are presently `running` on this worker.
    pub async fn count_running_for_worker(&self, worker: WorkerId) -> Result<i64, RepoError> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE worker_ref = $1 AND state = 'running'",
        )
        .bind(worker.to_string());
        self.pool.with_ro("task", "count_running_for_worker").fetch_scalar(query).await
    }

    /// The heartbeat ack's "pending-assignment count" (§6): tasks bound to
    /// this worker that it hasn't finished yet.
    pub async fn count_assigned_for_worker(&self, worker: WorkerId) -> Result<i64, RepoError> {
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE worker_ref = $1 AND state IN ('assigned', 'running')",
        )
        .bind(worker.to_string());
        self.pool.with_ro("task", "count_assigned_for_worker").fetch_scalar(query).await
    }
}
