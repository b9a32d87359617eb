//! The worker's HTTP client for the control plane surface it touches (§6):
//! register, heartbeat, status-check, result/screenshot POST, and the
//! best-effort distribute nudge. A trait so tests substitute a fake and
//! never touch the network (SPEC_FULL §10.5).

use crate::error::ControlPlaneError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::time::Duration;
use taskmesh_common::ids::{ExecutionId, TaskId, WorkerId};

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub executor_uuid: WorkerId,
    pub executor_name: String,
    pub platform: Option<String>,
    pub browser_types: Vec<String>,
    pub owner_username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub uuid: WorkerId,
    pub state: String,
    pub current_tasks: u32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatAck {
    pub pending_tasks: i64,
}

/// `{status, is_valid}` from `GET /executions/{id}/status_check` (§6). The
/// pull side of the stop protocol, consulted by the intake loop (§4.7 step
/// 2), the heartbeat loop (§4.8) and the runner (§4.9 steps 1 and 3).
#[derive(Debug, Clone)]
pub struct StatusCheck {
    pub status: String,
    pub is_valid: bool,
}

impl StatusCheck {
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }
}

#[derive(Debug, Clone)]
pub struct TaskResultReport {
    pub status: String,
    pub message: Option<String>,
    pub steps: Vec<Json>,
    pub duration: f64,
    pub logs: Vec<String>,
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn register(&self, req: RegisterRequest) -> Result<WorkerId, ControlPlaneError>;
    async fn heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatAck, ControlPlaneError>;
    async fn status_check(&self, execution_id: ExecutionId) -> Result<StatusCheck, ControlPlaneError>;
    async fn post_result(&self, task_id: TaskId, report: TaskResultReport) -> Result<(), ControlPlaneError>;
    async fn post_screenshot(
        &self,
        task_id: TaskId,
        image_data: String,
        is_failure: bool,
    ) -> Result<String, ControlPlaneError>;
    /// Best-effort `POST /tasks/distribute` nudge (§4.9 step 5). Failure is
    /// never fatal — the periodic dispatch tick will eventually pick up
    /// whatever this would have nudged.
    async fn nudge_dispatch(&self);
}

/// Production client over `reqwest`, with the per-endpoint timeouts from
/// §5: heartbeat 5s, status-check 2-3s, result POST 10s, registration 10s.
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: url::Url) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
        })
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("static path joins cleanly")
    }
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    executor_uuid: WorkerId,
    executor_name: &'a str,
    platform: Option<&'a str>,
    browser_types: &'a [String],
    owner_username: Option<&'a str>,
}

#[derive(Deserialize)]
struct RegisterResponseBody {
    #[allow(dead_code)]
    executor_id: uuid::Uuid,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    executor_uuid: WorkerId,
    state: &'a str,
    current_tasks: u32,
    cpu_usage: f64,
    memory_usage: f64,
    disk_usage: f64,
    message: Option<&'a str>,
}

#[derive(Deserialize)]
struct HeartbeatResponseBody {
    #[allow(dead_code)]
    server_time: chrono::DateTime<chrono::Utc>,
    pending_tasks: i64,
}

#[derive(Deserialize)]
struct StatusCheckResponseBody {
    status: String,
    is_valid: bool,
}

#[derive(Serialize)]
struct ResultBody<'a> {
    status: &'a str,
    message: &'a Option<String>,
    steps: &'a [Json],
    duration: f64,
    logs: &'a [String],
}

#[derive(Serialize)]
struct ScreenshotBody<'a> {
    image_data: &'a str,
    is_failure: bool,
}

#[derive(Deserialize)]
struct ScreenshotResponseBody {
    path: String,
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn register(&self, req: RegisterRequest) -> Result<WorkerId, ControlPlaneError> {
        let body = RegisterBody {
            executor_uuid: req.executor_uuid,
            executor_name: &req.executor_name,
            platform: req.platform.as_deref(),
            browser_types: &req.browser_types,
            owner_username: req.owner_username.as_deref(),
        };

        let response = self
            .client
            .post(self.url("/executor/register"))
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: RegisterResponseBody = response.json().await?;
        Ok(WorkerId::from(parsed.executor_id))
    }

    async fn heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatAck, ControlPlaneError> {
        let body = HeartbeatBody {
            executor_uuid: report.uuid,
            state: &report.state,
            current_tasks: report.current_tasks,
            cpu_usage: report.cpu_usage,
            memory_usage: report.memory_usage,
            disk_usage: report.disk_usage,
            message: report.message.as_deref(),
        };

        let response = self
            .client
            .post(self.url("/executor/heartbeat"))
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: HeartbeatResponseBody = response.json().await?;
        Ok(HeartbeatAck {
            pending_tasks: parsed.pending_tasks,
        })
    }

    async fn status_check(&self, execution_id: ExecutionId) -> Result<StatusCheck, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&format!("/executions/{execution_id}/status_check")))
            .timeout(Duration::from_secs(3))
            .send()
            .await?
            .error_for_status()?;

        let parsed: StatusCheckResponseBody = response.json().await?;
        Ok(StatusCheck {
            status: parsed.status,
            is_valid: parsed.is_valid,
        })
    }

    async fn post_result(&self, task_id: TaskId, report: TaskResultReport) -> Result<(), ControlPlaneError> {
        let body = ResultBody {
            status: &report.status,
            message: &report.message,
            steps: &report.steps,
            duration: report.duration,
            logs: &report.logs,
        };

        self.client
            .post(self.url(&format!("/tasks/{task_id}/result")))
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn post_screenshot(
        &self,
        task_id: TaskId,
        image_data: String,
        is_failure: bool,
    ) -> Result<String, ControlPlaneError> {
        let body = ScreenshotBody {
            image_data: &image_data,
            is_failure,
        };

        let response = self
            .client
            .post(self.url(&format!("/tasks/{task_id}/screenshot")))
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: ScreenshotResponseBody = response.json().await?;
        Ok(parsed.path)
    }

    async fn nudge_dispatch(&self) {
        let result = self
            .client
            .post(self.url("/tasks/distribute"))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        if let Err(err) = result {
            tracing::debug!(error = %err, "best-effort distribute nudge failed");
        }
    }
}
