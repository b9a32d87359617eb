//! C9 — the worker runner (§4.9). Owns a single task end to end: the
//! early-stop guard, the step loop against a lazily-launched browser, result
//! composition/reporting, and the local bookkeeping (§4.9 steps 5-6) that
//! removes the task from `RunningTasks`, updates the plan-history view, and
//! drains one queued sequential sibling if a slot just freed up (§4.10).
//!
//! `execute` takes `self: Arc<Self>` so it can spawn itself again when
//! draining a sequential sibling — the drained payload was already acked by
//! the intake loop (§4.7 step 4), so nothing but another `execute` call is
//! needed to run it.

use crate::control_plane_client::{ControlPlaneClient, TaskResultReport};
use crate::interpolation::interpolate_value;
use crate::running_tasks::RunningTasks;
use crate::sanitize::{strip_control_chars, strip_control_chars_vec};
use crate::sequential_queue::SequentialQueue;
use crate::step_executor::BrowserFactory;
use crate::stopped_cache::{PlanHistory, PlanScriptView, PlanView, StoppedCache};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use std::time::Instant;
use taskmesh_broker::{Step, TaskPayload};
use taskmesh_common::ids::ExecutionId;
use tracing::{info, warn};

/// Re-check the parent's status every `STATUS_POLL_STRIDE` completed steps
/// (§4.9 step 3), rather than before every single one.
const STATUS_POLL_STRIDE: usize = 3;

pub struct Runner {
    control_plane: Arc<dyn ControlPlaneClient>,
    browser_factory: Arc<dyn BrowserFactory>,
    running_tasks: Arc<RunningTasks>,
    stopped_cache: Arc<StoppedCache>,
    plan_history: Arc<PlanHistory>,
    sequential_queue: Arc<SequentialQueue>,
    max_concurrent: u32,
}

impl Runner {
    pub fn new(
        control_plane: Arc<dyn ControlPlaneClient>,
        browser_factory: Arc<dyn BrowserFactory>,
        running_tasks: Arc<RunningTasks>,
        stopped_cache: Arc<StoppedCache>,
        plan_history: Arc<PlanHistory>,
        sequential_queue: Arc<SequentialQueue>,
        max_concurrent: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            control_plane,
            browser_factory,
            running_tasks,
            stopped_cache,
            plan_history,
            sequential_queue,
            max_concurrent,
        })
    }

    /// Registers `payload` as `Starting` and hands it to a freshly spawned
    /// `execute` task. Called by the intake loop (§4.7 step 5) and, on
    /// completion, by `execute` itself when draining a sequential sibling.
    pub fn admit(self: &Arc<Self>, payload: TaskPayload) {
        self.running_tasks
            .insert_starting(payload.task_id, payload.execution_id, payload.parent_execution_id);
        let this = self.clone();
        tokio::spawn(async move { this.execute(payload).await });
    }

    async fn is_stopped(&self, id: ExecutionId) -> bool {
        if self.stopped_cache.contains(id) {
            return true;
        }
        match self.control_plane.status_check(id).await {
            Ok(check) if check.is_stopped() => {
                self.stopped_cache.insert(id);
                true
            }
            Ok(_) => false,
            // §7: transient control-plane errors mutate no state; the task
            // keeps running and the next poll tries again.
            Err(err) => {
                warn!(execution_id = %id, error = %err, "status check failed, assuming not stopped");
                false
            }
        }
    }

    pub async fn execute(self: Arc<Self>, payload: TaskPayload) {
        self.running_tasks.mark_running(payload.task_id);
        self.remember_plan_view(&payload);

        let check_id = payload.parent_execution_id.unwrap_or(payload.execution_id);

        if self.is_stopped(check_id).await {
            info!(task_id = %payload.task_id, "stopped before execution began");
            self.report(&payload, "cancelled", Some("stopped before execution began".to_string()), vec![], 0.0, vec![])
                .await;
            self.finish(&payload, "cancelled").await;
            return;
        }

        let start = Instant::now();
        let mut session = match self.browser_factory.launch(&payload.browser_type).await {
            Ok(session) => session,
            Err(err) => {
                warn!(task_id = %payload.task_id, error = %err, "failed to start browser session");
                self.report(&payload, "failed", Some(format!("failed to start browser: {err}")), vec![], 0.0, vec![])
                    .await;
                self.finish(&payload, "failed").await;
                return;
            }
        };

        let (status, message, steps, logs) = self.run_steps(session.as_mut(), &payload, check_id).await;
        session.close().await;

        let duration = start.elapsed().as_secs_f64();
        self.report(&payload, status, message, steps, duration, logs).await;
        self.finish(&payload, status).await;
    }

    async fn run_steps(
        &self,
        session: &mut (dyn crate::step_executor::BrowserSession),
        payload: &TaskPayload,
        check_id: ExecutionId,
    ) -> (&'static str, Option<String>, Vec<Json>, Vec<String>) {
        let mut records = Vec::with_capacity(payload.script_data.steps.len());
        let mut logs = Vec::new();

        for (index, step) in payload.script_data.steps.iter().enumerate() {
            if index > 0 && index % STATUS_POLL_STRIDE == 0 && self.is_stopped(check_id).await {
                logs.push(format!("execution stopped before step {index} ('{}')", step.name));
                return ("cancelled", Some("stopped mid-execution".to_string()), records, logs);
            }

            let resolved = resolve_step(step, &payload.variables);
            let step_started = Instant::now();
            let outcome = session.run_step(&resolved).await;
            let step_duration = step_started.elapsed().as_secs_f64();

            records.push(json!({
                "index": index,
                "name": step.name,
                "type": step.step_type,
                "success": outcome.success,
                "message": outcome.message,
                "duration": step_duration,
            }));

            if !outcome.success {
                let failure_message = outcome.message.unwrap_or_else(|| format!("step '{}' failed", step.name));
                logs.push(failure_message.clone());

                if let Some(image) = session.capture_screenshot().await {
                    match self.control_plane.post_screenshot(payload.task_id, image, true).await {
                        Ok(path) => logs.push(format!("failure screenshot saved at {path}")),
                        Err(err) => warn!(task_id = %payload.task_id, error = %err, "failure screenshot upload failed"),
                    }
                }

                return ("failed", Some(failure_message), records, logs);
            }
        }

        ("completed", None, records, logs)
    }

    async fn report(
        &self,
        payload: &TaskPayload,
        status: &str,
        message: Option<String>,
        steps: Vec<Json>,
        duration: f64,
        logs: Vec<String>,
    ) {
        let report = TaskResultReport {
            status: status.to_string(),
            message: message.map(|m| strip_control_chars(&m)),
            steps,
            duration,
            logs: strip_control_chars_vec(&logs),
        };

        match self.control_plane.post_result(payload.task_id, report).await {
            Ok(()) => self.control_plane.nudge_dispatch().await,
            Err(err) => warn!(task_id = %payload.task_id, error = %err, "result report failed"),
        }
    }

    fn remember_plan_view(&self, payload: &TaskPayload) {
        let Some(parent) = payload.parent_execution_id else {
            return;
        };
        if self.plan_history.get(parent).is_some() {
            return;
        }

        let scripts = payload
            .plan_scripts
            .iter()
            .map(|script| PlanScriptView {
                index: script.index,
                name: script.name.clone(),
                state: if Some(script.index) == payload.script_index {
                    "running".to_string()
                } else {
                    "pending".to_string()
                },
            })
            .collect();

        self.plan_history.record(
            parent,
            PlanView {
                plan_name: format!("plan-{parent}"),
                mode: payload.mode.map(|m| m.to_string()).unwrap_or_else(|| "sequential".to_string()),
                scripts,
            },
        );
    }

    async fn finish(self: &Arc<Self>, payload: &TaskPayload, status: &str) {
        self.running_tasks.remove(payload.task_id);

        let Some(parent) = payload.parent_execution_id else {
            return;
        };

        if let Some(index) = payload.script_index {
            self.plan_history.update_script_state(parent, index, status);
        }

        self.drain_sequential_queue(parent);
    }

    /// §4.10: once this task's slot is free, hand the next sibling queued
    /// for the same parent to a fresh `execute`, provided no other sibling
    /// is already occupying a slot and the worker is still under capacity.
    fn drain_sequential_queue(self: &Arc<Self>, parent: ExecutionId) {
        if self.running_tasks.has_task_with_parent(parent) {
            return;
        }
        if self.running_tasks.len() >= self.max_concurrent as usize {
            return;
        }
        if let Some(next) = self.sequential_queue.pop(parent) {
            self.admit(next);
        }
    }
}

fn resolve_step(step: &Step, variables: &std::collections::HashMap<String, Json>) -> Step {
    let params_value = Json::Object(step.params.clone().into_iter().collect());
    let resolved = interpolate_value(&params_value, variables);
    let params = match resolved {
        Json::Object(map) => map.into_iter().collect(),
        _ => step.params.clone(),
    };
    Step {
        step_type: step.step_type.clone(),
        name: step.name.clone(),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane_client::{HeartbeatAck, HeartbeatReport, RegisterRequest, StatusCheck};
    use crate::step_executor::{BrowserSession, StepOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use taskmesh_broker::ScriptData;
    use taskmesh_common::ids::{ScriptId, TaskId, WorkerId};

    #[derive(Default)]
    struct FakeControlPlane {
        stopped: StdMutex<std::collections::HashSet<ExecutionId>>,
        results: StdMutex<Vec<TaskResultReport>>,
    }

    impl FakeControlPlane {
        fn mark_stopped(&self, id: ExecutionId) {
            self.stopped.lock().unwrap().insert(id);
        }
    }

    #[async_trait]
    impl ControlPlaneClient for FakeControlPlane {
        async fn register(&self, _req: RegisterRequest) -> Result<WorkerId, crate::error::ControlPlaneError> {
            Ok(WorkerId::new_v4())
        }

        async fn heartbeat(&self, _report: HeartbeatReport) -> Result<HeartbeatAck, crate::error::ControlPlaneError> {
            Ok(HeartbeatAck { pending_tasks: 0 })
        }

        async fn status_check(&self, execution_id: ExecutionId) -> Result<StatusCheck, crate::error::ControlPlaneError> {
            let stopped = self.stopped.lock().unwrap().contains(&execution_id);
            Ok(StatusCheck {
                status: if stopped { "stopped".to_string() } else { "running".to_string() },
                is_valid: true,
            })
        }

        async fn post_result(&self, _task_id: TaskId, report: TaskResultReport) -> Result<(), crate::error::ControlPlaneError> {
            self.results.lock().unwrap().push(report);
            Ok(())
        }

        async fn post_screenshot(
            &self,
            _task_id: TaskId,
            _image_data: String,
            _is_failure: bool,
        ) -> Result<String, crate::error::ControlPlaneError> {
            Ok("media/shot.png".to_string())
        }

        async fn nudge_dispatch(&self) {}
    }

    struct ScriptedSession {
        fail_step: Option<String>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn run_step(&mut self, step: &Step) -> StepOutcome {
            if self.fail_step.as_deref() == Some(step.name.as_str()) {
                StepOutcome::failed("boom")
            } else {
                StepOutcome::ok()
            }
        }

        async fn capture_screenshot(&mut self) -> Option<String> {
            Some("base64-image".to_string())
        }

        async fn close(self: Box<Self>) {}
    }

    struct ScriptedFactory {
        fail_step: Option<String>,
    }

    #[async_trait]
    impl BrowserFactory for ScriptedFactory {
        async fn launch(&self, _browser_type: &str) -> anyhow::Result<Box<dyn BrowserSession>> {
            Ok(Box::new(ScriptedSession {
                fail_step: self.fail_step.clone(),
            }))
        }
    }

    fn payload(execution_id: ExecutionId, parent: Option<ExecutionId>, steps: Vec<Step>) -> TaskPayload {
        TaskPayload {
            task_id: TaskId::new_v4(),
            execution_id,
            browser_type: "chromium".to_string(),
            timeout: 60,
            variables: HashMap::new(),
            script_data: ScriptData {
                script_id: ScriptId::new_v4(),
                name: "flow".to_string(),
                description: String::new(),
                script_type: "ui".to_string(),
                framework: "playwright".to_string(),
                steps,
                variables: HashMap::new(),
                timeout: 60,
                project_id: None,
            },
            parent_execution_id: parent,
            mode: None,
            script_index: parent.map(|_| 0),
            total_scripts: parent.map(|_| 1),
            plan_scripts: vec![],
        }
    }

    fn step(name: &str) -> Step {
        Step {
            step_type: "click".to_string(),
            name: name.to_string(),
            params: HashMap::new(),
        }
    }

    fn runner(control_plane: Arc<FakeControlPlane>, factory: Arc<dyn BrowserFactory>, max_concurrent: u32) -> Arc<Runner> {
        Runner::new(
            control_plane,
            factory,
            Arc::new(RunningTasks::new()),
            Arc::new(StoppedCache::new()),
            Arc::new(PlanHistory::new()),
            Arc::new(SequentialQueue::new()),
            max_concurrent,
        )
    }

    #[tokio::test]
    async fn completed_task_removes_itself_from_running_tasks() {
        let control_plane = Arc::new(FakeControlPlane::default());
        let factory: Arc<dyn BrowserFactory> = Arc::new(ScriptedFactory { fail_step: None });
        let runner = runner(control_plane.clone(), factory, 3);

        let execution_id = ExecutionId::new_v4();
        let task = payload(execution_id, None, vec![step("open"), step("click")]);
        let task_id = task.task_id;

        runner.running_tasks.insert_starting(task_id, execution_id, None);
        runner.clone().execute(task).await;

        assert!(!runner.running_tasks.contains(task_id));
        let results = control_plane.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "completed");
    }

    #[tokio::test]
    async fn failed_step_uploads_a_screenshot_and_reports_failed() {
        let control_plane = Arc::new(FakeControlPlane::default());
        let factory: Arc<dyn BrowserFactory> = Arc::new(ScriptedFactory {
            fail_step: Some("click".to_string()),
        });
        let runner = runner(control_plane.clone(), factory, 3);

        let execution_id = ExecutionId::new_v4();
        let task = payload(execution_id, None, vec![step("open"), step("click")]);
        let task_id = task.task_id;

        runner.running_tasks.insert_starting(task_id, execution_id, None);
        runner.clone().execute(task).await;

        let results = control_plane.results.lock().unwrap();
        assert_eq!(results[0].status, "failed");
        assert!(results[0].logs.iter().any(|l| l.contains("screenshot")));
    }

    #[tokio::test]
    async fn early_stop_guard_reports_cancelled_without_launching_a_browser() {
        let control_plane = Arc::new(FakeControlPlane::default());
        let execution_id = ExecutionId::new_v4();
        control_plane.mark_stopped(execution_id);

        let factory: Arc<dyn BrowserFactory> = Arc::new(ScriptedFactory { fail_step: None });
        let runner = runner(control_plane.clone(), factory, 3);

        let task = payload(execution_id, None, vec![step("open")]);
        let task_id = task.task_id;
        runner.running_tasks.insert_starting(task_id, execution_id, None);
        runner.clone().execute(task).await;

        let results = control_plane.results.lock().unwrap();
        assert_eq!(results[0].status, "cancelled");
    }

    #[tokio::test]
    async fn draining_a_sequential_sibling_admits_it_after_the_first_finishes() {
        let control_plane = Arc::new(FakeControlPlane::default());
        let factory: Arc<dyn BrowserFactory> = Arc::new(ScriptedFactory { fail_step: None });
        let runner = runner(control_plane.clone(), factory, 1);

        let parent = ExecutionId::new_v4();
        let first = payload(ExecutionId::new_v4(), Some(parent), vec![step("open")]);
        let second = payload(ExecutionId::new_v4(), Some(parent), vec![step("open")]);
        let second_task_id = second.task_id;

        runner.sequential_queue.push(parent, second);
        runner.running_tasks.insert_starting(first.task_id, first.execution_id, Some(parent));
        runner.clone().execute(first).await;

        // give the spawned drain task a chance to run
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if !runner.running_tasks.contains(second_task_id) && runner.running_tasks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(control_plane.results.lock().unwrap().len(), 2);
    }
}
