//! Execution create/status-check/stop (§6).

use crate::service::execution::{CreateExecutionRequest, ExecutionService};
use crate::service::{ExecutionError, StopController, StopError};
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use taskmesh_common::ids::{ExecutionId, PlanId, ScriptId};
use taskmesh_common::model::ExecutionMode;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::api::ApiError;
use uuid::Uuid;

fn map_execution_err(err: ExecutionError) -> ApiError {
    match err {
        ExecutionError::NotFound(_) => ApiError::not_found(err.to_safe_string()),
        ExecutionError::AmbiguousTarget => ApiError::bad_request([err.to_safe_string()]),
        _ => ApiError::internal(err.to_safe_string()),
    }
}

fn map_stop_err(err: StopError) -> ApiError {
    match err {
        StopError::NotFound(_) => ApiError::not_found(err.to_safe_string()),
        StopError::AlreadyTerminal(_) => ApiError::conflict(err.to_safe_string()),
        StopError::Repo(_) => ApiError::internal(err.to_safe_string()),
    }
}

#[derive(Object, Debug)]
struct CreateRequest {
    plan_id: Option<Uuid>,
    script_id: Option<Uuid>,
    execution_mode: Option<String>,
    owner: String,
    #[oai(default)]
    variables: HashMap<String, JsonValue>,
}

#[derive(Object, Debug)]
struct ExecutionView {
    id: Uuid,
    display_id: String,
    kind: String,
    state: String,
    owner: String,
}

impl From<crate::model::Execution> for ExecutionView {
    fn from(e: crate::model::Execution) -> Self {
        Self {
            id: e.id.0,
            display_id: e.display_id,
            kind: e.kind.to_string(),
            state: e.state.to_string(),
            owner: e.owner,
        }
    }
}

#[derive(Object, Debug)]
struct StatusCheckResponse {
    status: String,
    is_valid: bool,
}

pub struct ExecutionApi {
    executions: ExecutionService,
    stop_controller: StopController,
}

impl ExecutionApi {
    pub fn new(executions: ExecutionService, stop_controller: StopController) -> Self {
        Self {
            executions,
            stop_controller,
        }
    }
}

#[OpenApi(tag = "super::ApiTags::Execution")]
impl ExecutionApi {
    #[oai(path = "/executions", method = "post", operation_id = "create_execution")]
    async fn create(&self, req: Json<CreateRequest>) -> Result<Json<ExecutionView>, ApiError> {
        let req = req.0;

        let execution_mode = req
            .execution_mode
            .map(|m| m.parse::<ExecutionMode>())
            .transpose()
            .map_err(|_| ApiError::bad_request(["unrecognized execution_mode"]))?;

        let execution = self
            .executions
            .create(CreateExecutionRequest {
                plan_id: req.plan_id.map(PlanId::from),
                script_id: req.script_id.map(ScriptId::from),
                execution_mode,
                owner: req.owner,
                variables: req.variables,
            })
            .await
            .map_err(map_execution_err)?;

        Ok(Json(execution.into()))
    }

    #[oai(
        path = "/executions/:id/status_check",
        method = "get",
        operation_id = "execution_status_check"
    )]
    async fn status_check(&self, id: Path<Uuid>) -> Result<Json<StatusCheckResponse>, ApiError> {
        let check = self
            .executions
            .status_check(ExecutionId::from(id.0))
            .await
            .map_err(map_execution_err)?;

        Ok(Json(StatusCheckResponse {
            status: check.state.to_string(),
            is_valid: check.is_valid,
        }))
    }

    #[oai(path = "/executions/:id/stop", method = "post", operation_id = "stop_execution")]
    async fn stop(&self, id: Path<Uuid>) -> Result<Json<serde_json::Value>, ApiError> {
        self.stop_controller
            .stop(ExecutionId::from(id.0))
            .await
            .map_err(map_stop_err)?;
        Ok(Json(serde_json::json!({"stopped": true})))
    }
}
