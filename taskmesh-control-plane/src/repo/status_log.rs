//! The append-only heartbeat status-log (§4.4's "ops visibility" table) and
//! its §10.6 retention pruning, so the table doesn't grow forever between
//! operator glances.

use chrono::Utc;
use taskmesh_common::ids::WorkerId;
use taskmesh_common::model::WorkerState;
use taskmesh_service_base::db::Pool;
use taskmesh_service_base::repo::RepoError;

#[derive(Clone)]
pub struct StatusLogRepo {
    pool: Pool,
}

pub struct NewStatusLogEntry {
    pub worker_ref: WorkerId,
    pub state: WorkerState,
    pub current_tasks: i32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub message: Option<String>,
}

impl StatusLogRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: NewStatusLogEntry) -> Result<(), RepoError> {
        let query = sqlx::query(
            "INSERT INTO status_log \
             (worker_ref, state, current_tasks, cpu_usage, memory_usage, disk_usage, message, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(entry.worker_ref.to_string())
        .bind(entry.state.to_string())
        .bind(entry.current_tasks)
        .bind(entry.cpu_usage)
        .bind(entry.memory_usage)
        .bind(entry.disk_usage)
        .bind(entry.message)
        .bind(Utc::now().to_rfc3339());

        self.pool.with_rw("status_log", "append").execute(query).await?;
        Ok(())
    }

    /// §10.6 retention: drops entries older than `retention_days`. Run on a
    /// timer by the control plane's background maintenance loop, not on
    /// every heartbeat.
    pub async fn prune_older_than(&self, retention_days: i64) -> Result<u64, RepoError> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let query = sqlx::query("DELETE FROM status_log WHERE created_at < $1").bind(cutoff);
        let result = self.pool.with_rw("status_log", "prune_older_than").execute(query).await?;
        Ok(result.rows_affected())
    }
}
