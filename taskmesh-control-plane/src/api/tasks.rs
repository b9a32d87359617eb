//! Task result/screenshot ingestion and the best-effort dispatcher nudge
//! (§6, §4.7 step 9).

use crate::service::dispatcher::Dispatcher;
use crate::service::result::{ResultHandler, TaskResult};
use crate::service::{ResultError, ScreenshotError, ScreenshotService};
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde_json::json;
use taskmesh_common::ids::TaskId;
use taskmesh_common::model::TaskOutcome;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::api::ApiError;
use uuid::Uuid;

fn map_result_err(err: ResultError) -> ApiError {
    match err {
        ResultError::NotFound(_) => ApiError::not_found(err.to_safe_string()),
        _ => ApiError::internal(err.to_safe_string()),
    }
}

fn map_screenshot_err(err: ScreenshotError) -> ApiError {
    match err {
        ScreenshotError::NotFound(_) => ApiError::not_found(err.to_safe_string()),
        ScreenshotError::InvalidImageData => ApiError::bad_request([err.to_safe_string()]),
        _ => ApiError::internal(err.to_safe_string()),
    }
}

/// The worker's cleaned result payload (§4.9 step 5): raw screenshot bytes
/// are never part of this — those go through `/tasks/{id}/screenshot`
/// instead, and control characters other than `\n\r\t` are stripped by the
/// worker agent before this reaches us.
#[derive(Object, Debug)]
struct ResultRequest {
    status: String,
    message: Option<String>,
    #[oai(default)]
    steps: Vec<serde_json::Value>,
    duration: Option<f64>,
    #[oai(default)]
    logs: Vec<String>,
}

#[derive(Object, Debug)]
struct ScreenshotRequest {
    image_data: String,
    #[oai(default)]
    is_failure: bool,
}

#[derive(Object, Debug)]
struct ScreenshotResponse {
    path: String,
}

#[derive(Object, Debug)]
struct DistributeResponse {
    bound: u32,
}

pub struct TaskApi {
    result_handler: ResultHandler,
    screenshot_service: ScreenshotService,
    dispatcher: Dispatcher,
}

impl TaskApi {
    pub fn new(result_handler: ResultHandler, screenshot_service: ScreenshotService, dispatcher: Dispatcher) -> Self {
        Self {
            result_handler,
            screenshot_service,
            dispatcher,
        }
    }
}

#[OpenApi(tag = "super::ApiTags::Task")]
impl TaskApi {
    #[oai(path = "/tasks/:id/result", method = "post", operation_id = "post_task_result")]
    async fn result(&self, id: Path<Uuid>, req: Json<ResultRequest>) -> Result<Json<serde_json::Value>, ApiError> {
        let req = req.0;
        let outcome: TaskOutcome = req
            .status
            .parse()
            .map_err(|_| ApiError::bad_request(["unrecognized status"]))?;

        let result = json!({
            "message": req.message,
            "steps": req.steps,
            "duration": req.duration,
            "logs": req.logs,
        });

        self.result_handler
            .record(TaskResult {
                task_id: TaskId::from(id.0),
                outcome,
                result,
                error: if outcome == TaskOutcome::Failed { req.message } else { None },
            })
            .await
            .map_err(map_result_err)?;

        Ok(Json(json!({"recorded": true})))
    }

    #[oai(path = "/tasks/:id/screenshot", method = "post", operation_id = "post_task_screenshot")]
    async fn screenshot(
        &self,
        id: Path<Uuid>,
        req: Json<ScreenshotRequest>,
    ) -> Result<Json<ScreenshotResponse>, ApiError> {
        let req = req.0;
        let path = self
            .screenshot_service
            .store(TaskId::from(id.0), &req.image_data, req.is_failure)
            .await
            .map_err(map_screenshot_err)?;
        Ok(Json(ScreenshotResponse { path }))
    }

    /// §4.9 step 5's best-effort post-result nudge, also usable directly by
    /// an operator.
    #[oai(path = "/tasks/distribute", method = "post", operation_id = "distribute_tasks")]
    async fn distribute(&self) -> Result<Json<DistributeResponse>, ApiError> {
        let bound = self
            .dispatcher
            .dispatch(50)
            .await
            .map_err(|e| ApiError::internal(e.to_safe_string()))?;
        Ok(Json(DistributeResponse { bound }))
    }
}
