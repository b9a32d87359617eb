//! Worker rows (§3, §4.4). Registration upserts by `uuid`; heartbeats only
//! ever move `last_heartbeat` forward and never let `current_tasks` decrease
//! (§8 property 6) — both rules live here rather than in the service layer
//! so no other caller can accidentally bypass them.

use crate::model::Worker;
use chrono::Utc;
use serde_json::Value as Json;
use taskmesh_common::ids::{ProjectId, WorkerId};
use taskmesh_common::model::{WorkerScope, WorkerState};
use taskmesh_service_base::db::{Backend, Pool};
use taskmesh_service_base::repo::RepoError;

#[derive(Clone)]
pub struct WorkerRepo {
    pool: Pool,
}

pub struct Registration {
    pub uuid: WorkerId,
    pub name: String,
    pub owner: String,
    pub platform: Option<String>,
    pub browser_types: Vec<String>,
}

impl WorkerRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: WorkerId) -> Result<Option<Worker>, RepoError> {
        let query = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1").bind(id.to_string());
        self.pool.with_ro("worker", "find").fetch_optional_as(query).await
    }

    pub async fn list(&self) -> Result<Vec<Worker>, RepoError> {
        let query = sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY created_at ASC");
        self.pool.with_ro("worker", "list").fetch_all_as(query).await
    }

    /// §4.4 register: upsert by uuid. First sight gets the documented
    /// defaults (`max_concurrent=3`, `scope=global`, `state=online`);
    /// re-registration refreshes identity fields and marks the worker
    /// online again.
    pub async fn upsert_registration(&self, reg: Registration) -> Result<Worker, RepoError> {
        let existing = self.find(reg.uuid).await?;
        let now = Utc::now().to_rfc3339();

        if existing.is_some() {
            let query = sqlx::query(
                "UPDATE workers SET name = $1, platform = $2, browser_types = $3, \
                 state = $4, last_heartbeat = $5, enabled = 1 WHERE id = $6",
            )
            .bind(&reg.name)
            .bind(&reg.platform)
            .bind(serde_json::to_string(&reg.browser_types).unwrap())
            .bind(WorkerState::Online.to_string())
            .bind(&now)
            .bind(reg.uuid.to_string());
            self.pool.with_rw("worker", "upsert_registration").execute(query).await?;
        } else {
            let query = sqlx::query(
                "INSERT INTO workers \
                 (id, name, owner, state, scope, bound_projects, max_concurrent, \
                  current_tasks, last_heartbeat, enabled, browser_types, platform, created_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
            )
            .bind(reg.uuid.to_string())
            .bind(&reg.name)
            .bind(&reg.owner)
            .bind(WorkerState::Online.to_string())
            .bind(WorkerScope::Global.to_string())
            .bind(Json::Array(vec![]).to_string())
            .bind(3i32)
            .bind(0i32)
            .bind(&now)
            .bind(1i64)
            .bind(serde_json::to_string(&reg.browser_types).unwrap())
            .bind(&reg.platform)
            .bind(&now);
            self.pool.with_rw("worker", "upsert_registration").execute(query).await?;
        }

        self.find(reg.uuid)
            .await?
            .ok_or_else(|| RepoError::Internal("worker vanished immediately after upsert".into()))
    }

    /// §4.4 heartbeat: `last_heartbeat` always advances; `current_tasks`
    /// only grows, never shrinks, here (the control plane's own decrements
    /// on task completion are the only thing allowed to lower it).
    pub async fn record_heartbeat(
        &self,
        id: WorkerId,
        state: WorkerState,
        reported_current_tasks: i32,
    ) -> Result<(), RepoError> {
        let query = sqlx::query(
            "UPDATE workers SET state = $1, \
             current_tasks = CASE WHEN $2 > current_tasks THEN $2 ELSE current_tasks END, \
             last_heartbeat = $3 WHERE id = $4",
        )
        .bind(state.to_string())
        .bind(reported_current_tasks)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string());
        self.pool.with_rw("worker", "record_heartbeat").execute(query).await?;
        Ok(())
    }

    /// Best-effort counter maintained alongside the authoritative live
    /// aggregate (§4.1.1); never let it go below zero. `MAX` is SQLite's
    /// scalar two-arg clamp; Postgres only has it as an aggregate and needs
    /// `GREATEST` for the same thing, so this branches on backend the same
    /// way `Backend::for_update` does.
    pub async fn adjust_current_tasks(&self, id: WorkerId, delta: i32) -> Result<(), RepoError> {
        let clamp = match self.pool.backend() {
            Backend::Postgres => "GREATEST",
            Backend::Sqlite => "MAX",
        };
        let sql = format!("UPDATE workers SET current_tasks = {clamp}(0, current_tasks + $1) WHERE id = $2");
        let query = sqlx::query(&sql).bind(delta).bind(id.to_string());
        self.pool.with_rw("worker", "adjust_current_tasks").execute(query).await?;
        Ok(())
    }

    /// §4.1.1 eligible set: enabled, state in {idle, online, busy}, and a
    /// heartbeat fresher than 120s. The scope/binding filter happens in the
    /// dispatcher; this just returns everyone alive.
    pub async fn eligible(&self) -> Result<Vec<Worker>, RepoError> {
        let query = sqlx::query_as::<_, Worker>(
            "SELECT * FROM workers WHERE enabled = 1 AND state IN ('idle', 'online', 'busy')",
        );
        let workers: Vec<Worker> = self.pool.with_ro("worker", "eligible").fetch_all_as(query).await?;
        let now = Utc::now();
        Ok(workers.into_iter().filter(|w| w.is_online(now)).collect())
    }

    pub async fn bound_projects(&self, id: WorkerId) -> Result<Vec<ProjectId>, RepoError> {
        Ok(self.find(id).await?.map(|w| w.bound_projects).unwrap_or_default())
    }
}
