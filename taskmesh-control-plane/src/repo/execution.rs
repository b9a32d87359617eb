//! Execution rows (§3, §4.3). `next_display_id` is the one piece of C1 the
//! spec calls out by name: a date-prefixed, sequence-per-day id, generated
//! under a row lock with retry-on-collision and a timestamp fallback.

use crate::model::Execution;
use chrono::Utc;
use serde_json::Value as Json;
use sqlx::any::AnyRow;
use sqlx::{Any, FromRow, Row, Transaction};
use taskmesh_common::ids::{ExecutionId, PlanId, ScriptId};
use taskmesh_common::model::{ExecutionKind, ExecutionMode, ExecutionState};
use taskmesh_service_base::db::Pool;
use taskmesh_service_base::repo::RepoError;

const DISPLAY_ID_COLLISION_RETRIES: u32 = 10;

#[derive(Clone)]
pub struct ExecutionRepo {
    pool: Pool,
}

pub struct NewExecution {
    pub kind: ExecutionKind,
    pub mode: Option<ExecutionMode>,
    pub parent: Option<ExecutionId>,
    pub plan_ref: Option<PlanId>,
    pub script_ref: Option<ScriptId>,
    pub variables_snapshot: Json,
    pub owner: String,
}

impl ExecutionRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: ExecutionId) -> Result<Option<Execution>, RepoError> {
        let query = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
            .bind(id.to_string());
        self.pool.with_ro("execution", "find").fetch_optional_as(query).await
    }

    pub async fn children(&self, parent: ExecutionId) -> Result<Vec<Execution>, RepoError> {
        let query =
            sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE parent = $1 ORDER BY created_at ASC")
                .bind(parent.to_string());
        self.pool.with_ro("execution", "children").fetch_all_as(query).await
    }

    /// Locks and re-reads the row inside the caller's transaction — used by
    /// the dispatcher (§4.1.d) and the stop controller before branching on
    /// current state.
    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Any>,
        id: ExecutionId,
    ) -> Result<Option<Execution>, RepoError> {
        let sql = format!(
            "SELECT * FROM executions WHERE id = $1{}",
            self.pool.backend().for_update()
        );
        let row: Option<AnyRow> = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&mut **tx).await?;
        row.map(|r| Execution::from_row(&r)).transpose().map_err(Into::into)
    }

    pub async fn create(&self, new: NewExecution) -> Result<Execution, RepoError> {
        let id = ExecutionId::new_v4();
        let mut display_id = self.next_display_id().await?;

        for attempt in 0..DISPLAY_ID_COLLISION_RETRIES {
            match self.insert(id, &display_id, &new).await {
                Ok(()) => {
                    return self.find(id).await?.ok_or_else(|| {
                        RepoError::Internal("execution vanished immediately after insert".into())
                    })
                }
                Err(RepoError::UniqueViolation(_)) if attempt + 1 < DISPLAY_ID_COLLISION_RETRIES => {
                    display_id = self.next_display_id().await?;
                }
                Err(other) => return Err(other),
            }
        }

        // Every retry collided; fall back to a timestamp-based id, unique by construction.
        display_id = format!("{}-{}", Utc::now().format("%Y%m%d"), Utc::now().timestamp_millis());
        self.insert(id, &display_id, &new).await?;

        self.find(id)
            .await?
            .ok_or_else(|| RepoError::Internal("execution vanished immediately after insert".into()))
    }

    async fn insert(&self, id: ExecutionId, display_id: &str, new: &NewExecution) -> Result<(), RepoError> {
        let query = sqlx::query(
            "INSERT INTO executions \
             (id, display_id, kind, mode, parent, plan_ref, script_ref, state, result, \
              variables_snapshot, breakpoints, current_step, started_at, completed_at, owner, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(id.to_string())
        .bind(display_id)
        .bind(new.kind.to_string())
        .bind(new.mode.map(|m| m.to_string()))
        .bind(new.parent.map(|p| p.to_string()))
        .bind(new.plan_ref.map(|p| p.to_string()))
        .bind(new.script_ref.map(|p| p.to_string()))
        .bind(ExecutionState::Pending.to_string())
        .bind(None::<String>)
        .bind(new.variables_snapshot.to_string())
        .bind(Json::Array(vec![]).to_string())
        .bind(0i64)
        .bind(None::<String>)
        .bind(None::<String>)
        .bind(&new.owner)
        .bind(Utc::now().to_rfc3339());

        self.pool.with_rw("execution", "create").execute(query).await?;
        Ok(())
    }

    /// Sets state and, when entering a terminal state, `completed_at`.
    /// Callers that already hold a lock (dispatcher, stop controller) pass
    /// their transaction; ad hoc callers may pass `None` for autocommit.
    pub async fn set_state(
        &self,
        tx: Option<&mut Transaction<'_, Any>>,
        id: ExecutionId,
        state: ExecutionState,
    ) -> Result<(), RepoError> {
        let completed_at = state.is_terminal().then(|| Utc::now().to_rfc3339());
        let started_at = matches!(state, ExecutionState::Running).then(|| Utc::now().to_rfc3339());

        let sql = "UPDATE executions SET state = $1, \
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
                self.pool.with_rw("execution", "set_state").execute(query).await?;
            }
        }
        Ok(())
    }

    pub async fn set_result(&self, id: ExecutionId, result: Json) -> Result<(), RepoError> {
        let query = sqlx::query("UPDATE executions SET result = $1 WHERE id = $2")
            .bind(result.to_string())
            .bind(id.to_string());
        self.pool.with_rw("execution", "set_result").execute(query).await?;
        Ok(())
    }

    /// §4.3: reads the max `display_id` with today's date prefix under a
    /// lock and returns one past it. A concurrent caller may take this
    /// exact id before our INSERT lands; `create` detects that via the
    /// unique constraint and calls back in here to draw the next one.
    async fn next_display_id(&self) -> Result<String, RepoError> {
        let prefix = Utc::now().format("%Y%m%d").to_string();

        let mut tx = self.pool.raw().begin().await?;
        let like_pattern = format!("{prefix}-%");
        let sql = format!(
            "SELECT display_id FROM executions WHERE display_id LIKE $1 \
             ORDER BY display_id DESC LIMIT 1{}",
            self.pool.backend().for_update()
        );
        let max: Option<String> = sqlx::query_scalar(&sql)
            .bind(&like_pattern)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        let next_seq = max
            .and_then(|id| id.rsplit('-').next().map(str::to_string))
            .and_then(|seq| seq.parse::<u32>().ok())
            .map(|n| n + 1)
            .unwrap_or(1);

        Ok(format!("{prefix}-{next_seq:04}"))
    }
}
