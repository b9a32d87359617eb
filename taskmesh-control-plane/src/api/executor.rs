//! Executor registration/heartbeat and the read-only listing endpoints the
//! redistribute operator tool depends on (§6).

use crate::service::registrar::{HeartbeatReport, WorkerRegistrar};
use crate::service::RegistrarError;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use taskmesh_common::ids::WorkerId;
use taskmesh_common::model::WorkerState;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::api::ApiError;
use uuid::Uuid;

fn map_err(err: RegistrarError) -> ApiError {
    match err {
        RegistrarError::UnknownWorker(_) => ApiError::not_found(err.to_safe_string()),
        RegistrarError::Repo(_) => ApiError::internal(err.to_safe_string()),
    }
}

#[derive(Object, Debug)]
struct RegisterRequest {
    executor_uuid: Uuid,
    executor_name: String,
    platform: Option<String>,
    #[oai(default)]
    browser_types: Vec<String>,
    owner_username: Option<String>,
}

#[derive(Object, Debug)]
struct RegisterResponse {
    executor_id: Uuid,
}

#[derive(Object, Debug)]
struct HeartbeatRequest {
    executor_uuid: Uuid,
    state: String,
    current_tasks: i32,
    cpu_usage: f64,
    memory_usage: f64,
    disk_usage: f64,
    message: Option<String>,
}

#[derive(Object, Debug)]
struct HeartbeatResponse {
    server_time: chrono::DateTime<chrono::Utc>,
    pending_tasks: i64,
}

#[derive(Object, Debug)]
struct WorkerView {
    id: Uuid,
    name: String,
    owner: String,
    state: String,
    scope: String,
    max_concurrent: i32,
    current_tasks: i32,
    enabled: bool,
    browser_types: Vec<String>,
    platform: Option<String>,
    last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<crate::model::Worker> for WorkerView {
    fn from(w: crate::model::Worker) -> Self {
        Self {
            id: w.id.0,
            name: w.name,
            owner: w.owner,
            state: w.state.to_string(),
            scope: w.scope.to_string(),
            max_concurrent: w.max_concurrent,
            current_tasks: w.current_tasks,
            enabled: w.enabled,
            browser_types: w.browser_types,
            platform: w.platform,
            last_heartbeat: w.last_heartbeat,
        }
    }
}

#[derive(Object, Debug)]
struct RedistributeResponse {
    requeued: u64,
}

pub struct ExecutorApi {
    registrar: WorkerRegistrar,
}

impl ExecutorApi {
    pub fn new(registrar: WorkerRegistrar) -> Self {
        Self { registrar }
    }
}

#[OpenApi(tag = "super::ApiTags::Executor")]
impl ExecutorApi {
    #[oai(path = "/executor/register", method = "post", operation_id = "register_executor")]
    async fn register(&self, req: Json<RegisterRequest>) -> Result<Json<RegisterResponse>, ApiError> {
        let req = req.0;
        let worker = self
            .registrar
            .register(
                WorkerId::from(req.executor_uuid),
                req.executor_name,
                req.owner_username.unwrap_or_else(|| "default".to_string()),
                req.platform,
                req.browser_types,
            )
            .await
            .map_err(map_err)?;

        Ok(Json(RegisterResponse { executor_id: worker.id.0 }))
    }

    #[oai(path = "/executor/heartbeat", method = "post", operation_id = "executor_heartbeat")]
    async fn heartbeat(&self, req: Json<HeartbeatRequest>) -> Result<Json<HeartbeatResponse>, ApiError> {
        let req = req.0;
        let state: WorkerState = req
            .state
            .parse()
            .map_err(|_| ApiError::bad_request(["unrecognized worker state"]))?;

        let ack = self
            .registrar
            .heartbeat(HeartbeatReport {
                uuid: WorkerId::from(req.executor_uuid),
                state,
                current_tasks: req.current_tasks,
                cpu_usage: req.cpu_usage,
                memory_usage: req.memory_usage,
                disk_usage: req.disk_usage,
                message: req.message,
            })
            .await
            .map_err(map_err)?;

        Ok(Json(HeartbeatResponse {
            server_time: ack.server_time,
            pending_tasks: ack.pending_tasks,
        }))
    }

    #[oai(path = "/executor/:uuid", method = "get", operation_id = "get_executor")]
    async fn get(&self, uuid: Path<Uuid>) -> Result<Json<WorkerView>, ApiError> {
        let worker = self.registrar.get(WorkerId::from(uuid.0)).await.map_err(map_err)?;
        Ok(Json(worker.into()))
    }

    #[oai(path = "/executors", method = "get", operation_id = "list_executors")]
    async fn list(&self) -> Result<Json<Vec<WorkerView>>, ApiError> {
        let workers = self.registrar.list().await.map_err(map_err)?;
        Ok(Json(workers.into_iter().map(WorkerView::from).collect()))
    }

    /// §10.6: operator tool, not part of the at-least-once delivery path.
    #[oai(path = "/executor/redistribute", method = "post", operation_id = "redistribute_executor")]
    async fn redistribute(&self, uuid: Query<Uuid>) -> Result<Json<RedistributeResponse>, ApiError> {
        let requeued = self
            .registrar
            .redistribute(WorkerId::from(uuid.0))
            .await
            .map_err(map_err)?;
        Ok(Json(RedistributeResponse { requeued }))
    }
}
