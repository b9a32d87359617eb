//! Exercises the intake loop (C7) and runner (C9) together against a real
//! broker stream (`FakeBroker`), rather than unit-testing `IntakeLoop::handle`
//! in isolation. Covers the two admission properties that only show up once
//! deliveries actually flow through `IntakeLoop::run`: an over-capacity
//! delivery gets requeued and is eventually admitted once a slot frees up
//! (S5), and a sequential sibling queues behind its running parent and drains
//! automatically once that parent finishes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use taskmesh_broker::{Broker, ScriptData, Step, TaskPayload};
use taskmesh_common::ids::{ExecutionId, ScriptId, TaskId, WorkerId};
use taskmesh_test_support::fake_broker::{FakeBroker, Outcome};
use taskmesh_worker_agent::control_plane_client::{
    ControlPlaneClient, HeartbeatAck, HeartbeatReport, RegisterRequest, StatusCheck, TaskResultReport,
};
use taskmesh_worker_agent::error::ControlPlaneError;
use taskmesh_worker_agent::intake::IntakeLoop;
use taskmesh_worker_agent::running_tasks::RunningTasks;
use taskmesh_worker_agent::runner::Runner;
use taskmesh_worker_agent::sequential_queue::SequentialQueue;
use taskmesh_worker_agent::step_executor::{BrowserFactory, BrowserSession, StepOutcome};
use taskmesh_worker_agent::stopped_cache::{PlanHistory, StoppedCache};

#[derive(Default)]
struct FakeControlPlane {
    stopped: StdMutex<std::collections::HashSet<ExecutionId>>,
    results: StdMutex<Vec<TaskResultReport>>,
    status_checks: AtomicUsize,
}

impl FakeControlPlane {
    fn mark_stopped(&self, id: ExecutionId) {
        self.stopped.lock().unwrap().insert(id);
    }

    fn results(&self) -> Vec<TaskResultReport> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlane {
    async fn register(&self, _req: RegisterRequest) -> Result<WorkerId, ControlPlaneError> {
        Ok(WorkerId::new_v4())
    }

    async fn heartbeat(&self, _report: HeartbeatReport) -> Result<HeartbeatAck, ControlPlaneError> {
        Ok(HeartbeatAck { pending_tasks: 0 })
    }

    async fn status_check(&self, execution_id: ExecutionId) -> Result<StatusCheck, ControlPlaneError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let stopped = self.stopped.lock().unwrap().contains(&execution_id);
        Ok(StatusCheck {
            status: if stopped { "stopped".to_string() } else { "running".to_string() },
            is_valid: true,
        })
    }

    async fn post_result(&self, _task_id: TaskId, report: TaskResultReport) -> Result<(), ControlPlaneError> {
        self.results.lock().unwrap().push(report);
        Ok(())
    }

    async fn post_screenshot(&self, _task_id: TaskId, _image_data: String, _is_failure: bool) -> Result<String, ControlPlaneError> {
        Ok("media/shot.png".to_string())
    }

    async fn nudge_dispatch(&self) {}
}

/// `run_step` sleeps for a fixed delay when `browser_type == "slow"`, and
/// returns instantly otherwise — lets a test hold one task "running" for a
/// known window without any cross-task synchronization primitives.
struct TimedSession {
    delay: Duration,
}

#[async_trait]
impl BrowserSession for TimedSession {
    async fn run_step(&mut self, _step: &Step) -> StepOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        StepOutcome::ok()
    }

    async fn capture_screenshot(&mut self) -> Option<String> {
        None
    }

    async fn close(self: Box<Self>) {}
}

struct TimedFactory {
    slow_delay: Duration,
}

#[async_trait]
impl BrowserFactory for TimedFactory {
    async fn launch(&self, browser_type: &str) -> anyhow::Result<Box<dyn BrowserSession>> {
        let delay = if browser_type == "slow" { self.slow_delay } else { Duration::ZERO };
        Ok(Box::new(TimedSession { delay }))
    }
}

fn payload(browser_type: &str, parent: Option<ExecutionId>) -> TaskPayload {
    TaskPayload {
        task_id: TaskId::new_v4(),
        execution_id: ExecutionId::new_v4(),
        browser_type: browser_type.to_string(),
        timeout: 60,
        variables: HashMap::new(),
        script_data: ScriptData {
            script_id: ScriptId::new_v4(),
            name: "flow".to_string(),
            description: String::new(),
            script_type: "ui".to_string(),
            framework: "playwright".to_string(),
            steps: vec![Step {
                step_type: "click".to_string(),
                name: "open".to_string(),
                params: HashMap::new(),
            }],
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

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true within the timeout");
}

#[tokio::test]
async fn over_capacity_delivery_is_requeued_and_eventually_admitted_through_the_full_intake_loop() {
    let broker = FakeBroker::new();
    let worker_id = WorkerId::new_v4();
    let control_plane = Arc::new(FakeControlPlane::default());
    let running_tasks = Arc::new(RunningTasks::new());
    let stopped_cache = Arc::new(StoppedCache::new());
    let sequential_queue = Arc::new(SequentialQueue::new());

    let factory: Arc<dyn BrowserFactory> = Arc::new(TimedFactory {
        slow_delay: Duration::from_millis(120),
    });
    let runner = Runner::new(
        control_plane.clone(),
        factory,
        running_tasks.clone(),
        stopped_cache.clone(),
        Arc::new(PlanHistory::new()),
        sequential_queue.clone(),
        1,
    );

    let intake = Arc::new(IntakeLoop::new(
        Arc::new(broker.clone()),
        worker_id,
        control_plane.clone(),
        runner,
        running_tasks.clone(),
        stopped_cache,
        sequential_queue,
        1,
    ));

    let occupier = payload("slow", None);
    let waiter = payload("fast", None);
    let waiter_task_id = waiter.task_id;

    broker.publish(worker_id, &occupier).await.unwrap();
    broker.publish(worker_id, &waiter).await.unwrap();

    let intake_handle = intake.clone();
    tokio::spawn(async move { intake_handle.run().await });

    // The occupier takes the single slot; the waiter gets nacked with
    // requeue at least once while it's held.
    wait_until(|| broker.outcomes().iter().any(|o| *o == Outcome::Nacked(waiter_task_id, true))).await;
    assert!(!running_tasks.contains(waiter_task_id));

    // Once the occupier finishes, the next redelivery of the waiter is
    // admitted instead of nacked again.
    wait_until(|| control_plane.results().len() == 2).await;

    let results = control_plane.results();
    assert!(results.iter().all(|r| r.status == "completed"));
    assert!(broker.outcomes().iter().any(|o| *o == Outcome::Acked(waiter_task_id)));
}

#[tokio::test]
async fn sequential_sibling_queues_behind_a_running_parent_and_drains_through_the_full_pipeline() {
    let broker = FakeBroker::new();
    let worker_id = WorkerId::new_v4();
    let control_plane = Arc::new(FakeControlPlane::default());
    let running_tasks = Arc::new(RunningTasks::new());
    let stopped_cache = Arc::new(StoppedCache::new());
    let sequential_queue = Arc::new(SequentialQueue::new());

    let factory: Arc<dyn BrowserFactory> = Arc::new(TimedFactory {
        slow_delay: Duration::from_millis(120),
    });
    let runner = Runner::new(
        control_plane.clone(),
        factory,
        running_tasks.clone(),
        stopped_cache.clone(),
        Arc::new(PlanHistory::new()),
        sequential_queue.clone(),
        2,
    );

    let intake = Arc::new(IntakeLoop::new(
        Arc::new(broker.clone()),
        worker_id,
        control_plane.clone(),
        runner,
        running_tasks.clone(),
        stopped_cache,
        sequential_queue.clone(),
        2,
    ));

    let parent = ExecutionId::new_v4();
    let first = payload("slow", Some(parent));
    let second = payload("fast", Some(parent));
    let second_task_id = second.task_id;

    broker.publish(worker_id, &first).await.unwrap();

    let intake_handle = intake.clone();
    tokio::spawn(async move { intake_handle.run().await });

    wait_until(|| running_tasks.has_task_with_parent(parent)).await;

    broker.publish(worker_id, &second).await.unwrap();

    // Queued behind its running sibling, not admitted directly.
    wait_until(|| sequential_queue.len_for(parent) == 1).await;
    assert!(!running_tasks.contains(second_task_id));
    assert!(broker.outcomes().iter().any(|o| *o == Outcome::Acked(second_task_id)));

    // Drains once the first finishes, with no further broker round-trip.
    wait_until(|| control_plane.results().len() == 2).await;
    assert_eq!(sequential_queue.len_for(parent), 0);

    let outcomes = broker.outcomes();
    assert_eq!(outcomes.iter().filter(|o| matches!(o, Outcome::Nacked(id, _) if *id == second_task_id)).count(), 0);
}

#[tokio::test]
async fn stopped_execution_delivery_is_dropped_without_ever_calling_status_check() {
    let broker = FakeBroker::new();
    let worker_id = WorkerId::new_v4();
    let control_plane = Arc::new(FakeControlPlane::default());
    let running_tasks = Arc::new(RunningTasks::new());
    let stopped_cache = Arc::new(StoppedCache::new());
    let sequential_queue = Arc::new(SequentialQueue::new());

    let execution_id = ExecutionId::new_v4();
    stopped_cache.insert(execution_id);

    let factory: Arc<dyn BrowserFactory> = Arc::new(TimedFactory { slow_delay: Duration::ZERO });
    let runner = Runner::new(
        control_plane.clone(),
        factory,
        running_tasks.clone(),
        stopped_cache.clone(),
        Arc::new(PlanHistory::new()),
        sequential_queue.clone(),
        1,
    );

    let intake = Arc::new(IntakeLoop::new(
        Arc::new(broker.clone()),
        worker_id,
        control_plane.clone(),
        runner,
        running_tasks.clone(),
        stopped_cache,
        sequential_queue,
        1,
    ));

    let mut task = payload("fast", None);
    task.execution_id = execution_id;
    let task_id = task.task_id;
    broker.publish(worker_id, &task).await.unwrap();

    let intake_handle = intake.clone();
    tokio::spawn(async move { intake_handle.run().await });

    wait_until(|| broker.outcomes().iter().any(|o| *o == Outcome::Nacked(task_id, false))).await;

    assert!(!running_tasks.contains(task_id));
    assert_eq!(control_plane.status_checks.load(Ordering::SeqCst), 0);
    assert!(control_plane.results().is_empty());
}
