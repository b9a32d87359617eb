//! C4 — worker registration and heartbeat ingestion (§4.4), plus the §10.6
//! operator-triggered redistribute tool that requeues a stale worker's
//! `assigned` tasks back to `pending`.

use crate::model::Worker;
use crate::repo::status_log::NewStatusLogEntry;
use crate::repo::worker::Registration;
use crate::repo::{StatusLogRepo, TaskRepo, WorkerRepo};
use taskmesh_common::ids::WorkerId;
use taskmesh_common::model::WorkerState;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
}

impl SafeDisplay for RegistrarError {
    fn to_safe_string(&self) -> String {
        match self {
            RegistrarError::UnknownWorker(_) => "worker is not registered".to_string(),
            RegistrarError::Repo(_) => "registration failed".to_string(),
        }
    }
}

pub struct HeartbeatReport {
    pub uuid: WorkerId,
    pub state: WorkerState,
    pub current_tasks: i32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub message: Option<String>,
}

pub struct HeartbeatAck {
    pub server_time: chrono::DateTime<chrono::Utc>,
    pub pending_tasks: i64,
}

#[derive(Clone)]
pub struct WorkerRegistrar {
    workers: WorkerRepo,
    tasks: TaskRepo,
    status_log: StatusLogRepo,
}

impl WorkerRegistrar {
    pub fn new(workers: WorkerRepo, tasks: TaskRepo, status_log: StatusLogRepo) -> Self {
        Self {
            workers,
            tasks,
            status_log,
        }
    }

    /// `POST /executor/register`, unauthenticated — the uuid is the
    /// credential. Upserts by uuid; defaults on first sight, refresh on
    /// re-registration (§4.4).
    pub async fn register(
        &self,
        uuid: WorkerId,
        name: String,
        owner: String,
        platform: Option<String>,
        browser_types: Vec<String>,
    ) -> Result<Worker, RegistrarError> {
        let worker = self
            .workers
            .upsert_registration(Registration {
                uuid,
                name,
                owner,
                platform,
                browser_types,
            })
            .await?;
        info!(worker_id = %uuid, "worker registered");
        Ok(worker)
    }

    /// `POST /executor/heartbeat`. `current_tasks` only ever grows here
    /// (§8 property 6); the control plane's own decrements on task
    /// completion are the only path that lowers it.
    pub async fn heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatAck, RegistrarError> {
        let worker = self
            .workers
            .find(report.uuid)
            .await?
            .ok_or(RegistrarError::UnknownWorker(report.uuid))?;

        self.workers
            .record_heartbeat(worker.id, report.state, report.current_tasks)
            .await?;

        self.status_log
            .append(NewStatusLogEntry {
                worker_ref: worker.id,
                state: report.state,
                current_tasks: report.current_tasks,
                cpu_usage: report.cpu_usage,
                memory_usage: report.memory_usage,
                disk_usage: report.disk_usage,
                message: report.message,
            })
            .await?;

        let pending_tasks = self.tasks.count_assigned_for_worker(worker.id).await?;

        Ok(HeartbeatAck {
            server_time: chrono::Utc::now(),
            pending_tasks,
        })
    }

    pub async fn get(&self, id: WorkerId) -> Result<Worker, RegistrarError> {
        self.workers.find(id).await?.ok_or(RegistrarError::UnknownWorker(id))
    }

    pub async fn list(&self) -> Result<Vec<Worker>, RegistrarError> {
        Ok(self.workers.list().await?)
    }

    /// §10.6: operator-triggered re-queue of every `assigned` task bound to
    /// `worker` back to `pending`. Mirrors the original system's
    /// `reset_tasks.py` recovery tool for a worker whose heartbeat has gone
    /// stale (§5's "existing assignments are not auto-rescinded" note).
    pub async fn redistribute(&self, worker: WorkerId) -> Result<u64, RegistrarError> {
        let requeued = self.tasks.requeue_assigned_for_worker(worker).await?;
        info!(worker_id = %worker, requeued, "redistributed worker's assigned tasks");
        Ok(requeued)
    }
}
