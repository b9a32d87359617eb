//! End-to-end exercises of §8's testable properties against a real
//! migrated SQLite store, using `FakeBroker` in place of AMQP.

use serde_json::json;
use std::sync::Arc;
use taskmesh_broker::{Broker, ScriptData, Step, TaskPayload};
use taskmesh_common::ids::{ExecutionId, TaskId, WorkerId};
use taskmesh_common::model::{ExecutionState, Priority, TaskOutcome, TaskState, WorkerState};
use taskmesh_control_plane::repo::execution::NewExecution;
use taskmesh_control_plane::repo::task::NewTask;
use taskmesh_control_plane::repo::worker::Registration;
use taskmesh_control_plane::repo::{ExecutionRepo, TaskRepo, WorkerRepo};
use taskmesh_control_plane::service::aggregator::NoopReportHook;
use taskmesh_control_plane::service::registrar::HeartbeatReport;
use taskmesh_control_plane::service::result::TaskResult;
use taskmesh_control_plane::service::{Dispatcher, PlanAggregator, ResultHandler, StopController, WorkerRegistrar};
use taskmesh_test_support::{FakeBroker, Store};

fn payload(task: TaskId, execution: ExecutionId) -> TaskPayload {
    TaskPayload {
        task_id: task,
        execution_id: execution,
        browser_type: "chromium".to_string(),
        timeout: 60,
        variables: Default::default(),
        script_data: ScriptData {
            script_id: taskmesh_common::ids::ScriptId::new_v4(),
            name: "login".to_string(),
            description: String::new(),
            script_type: "ui".to_string(),
            framework: "playwright".to_string(),
            steps: vec![Step {
                step_type: "click".to_string(),
                name: "submit".to_string(),
                params: Default::default(),
            }],
            variables: Default::default(),
            timeout: 60,
            project_id: None,
        },
        parent_execution_id: None,
        mode: None,
        script_index: None,
        total_scripts: None,
        plan_scripts: vec![],
    }
}

async fn store() -> Store {
    Store::new(taskmesh_control_plane::db::sqlite_migrator()).await.unwrap()
}

async fn register_worker(workers: &WorkerRepo, name: &str) -> WorkerId {
    let uuid = WorkerId::new_v4();
    workers
        .upsert_registration(Registration {
            uuid,
            name: name.to_string(),
            owner: "acme".to_string(),
            platform: Some("linux".to_string()),
            browser_types: vec!["chromium".to_string()],
        })
        .await
        .unwrap();
    uuid
}

#[tokio::test]
async fn dispatcher_binds_pending_task_to_an_eligible_worker_and_publishes_it() {
    let store = store().await;
    let executions = ExecutionRepo::new(store.pool.clone());
    let tasks = TaskRepo::new(store.pool.clone());
    let workers = WorkerRepo::new(store.pool.clone());
    let broker = Arc::new(FakeBroker::new());
    let clock = Arc::new(taskmesh_common::clock::FakeClock::at(chrono::Utc::now()));

    let worker_id = register_worker(&workers, "w1").await;
    broker.declare_worker_queue(worker_id).await.unwrap();

    let execution = executions
        .create(NewExecution {
            kind: taskmesh_common::model::ExecutionKind::Script,
            mode: None,
            parent: None,
            plan_ref: None,
            script_ref: None,
            variables_snapshot: json!({}),
            owner: "acme".to_string(),
        })
        .await
        .unwrap();

    let task_id = TaskId::new_v4();
    tasks
        .create(NewTask {
            id: task_id,
            execution_ref: execution.id,
            priority: Priority::Normal,
            payload: serde_json::to_value(payload(task_id, execution.id)).unwrap(),
        })
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.pool.clone(),
        executions.clone(),
        tasks.clone(),
        workers.clone(),
        broker.clone() as Arc<dyn taskmesh_broker::Broker>,
        clock,
    );

    let bound = dispatcher.dispatch(10).await.unwrap();
    assert_eq!(bound, 1);

    let dispatched = tasks.find(task_id).await.unwrap().unwrap();
    assert_eq!(dispatched.state, TaskState::Assigned);
    assert_eq!(dispatched.worker_ref, Some(worker_id));
    assert_eq!(broker.pending_count(worker_id), 1);

    // Property 1: no double-assignment — a second dispatch pass leaves it alone.
    let bound_again = dispatcher.dispatch(10).await.unwrap();
    assert_eq!(bound_again, 0);
}

#[tokio::test]
async fn heartbeat_current_tasks_never_decreases_from_a_stale_report() {
    let store = store().await;
    let workers = WorkerRepo::new(store.pool.clone());
    let tasks = TaskRepo::new(store.pool.clone());
    let status_log = taskmesh_control_plane::repo::StatusLogRepo::new(store.pool.clone());
    let registrar = WorkerRegistrar::new(workers.clone(), tasks.clone(), status_log.clone());

    let worker_id = register_worker(&workers, "w2").await;

    registrar
        .heartbeat(HeartbeatReport {
            uuid: worker_id,
            state: WorkerState::Busy,
            current_tasks: 3,
            cpu_usage: 10.0,
            memory_usage: 20.0,
            disk_usage: 5.0,
            message: None,
        })
        .await
        .unwrap();

    // A stale report claiming fewer tasks than the control plane already
    // knows about must not roll the counter backwards (§8 property 6).
    registrar
        .heartbeat(HeartbeatReport {
            uuid: worker_id,
            state: WorkerState::Busy,
            current_tasks: 1,
            cpu_usage: 10.0,
            memory_usage: 20.0,
            disk_usage: 5.0,
            message: None,
        })
        .await
        .unwrap();

    let worker = workers.find(worker_id).await.unwrap().unwrap();
    assert_eq!(worker.current_tasks, 3);
}

#[tokio::test]
async fn result_ingestion_is_idempotent_on_duplicate_posts() {
    let store = store().await;
    let executions = ExecutionRepo::new(store.pool.clone());
    let tasks = TaskRepo::new(store.pool.clone());
    let workers = WorkerRepo::new(store.pool.clone());
    let aggregator = PlanAggregator::new(executions.clone(), Arc::new(NoopReportHook));
    let broker = Arc::new(FakeBroker::new());
    let clock = Arc::new(taskmesh_common::clock::FakeClock::at(chrono::Utc::now()));
    let dispatcher = Dispatcher::new(
        store.pool.clone(),
        executions.clone(),
        tasks.clone(),
        workers.clone(),
        broker as Arc<dyn taskmesh_broker::Broker>,
        clock,
    );
    let result_handler = ResultHandler::new(
        executions.clone(),
        tasks.clone(),
        workers.clone(),
        aggregator,
        dispatcher,
    );

    let execution = executions
        .create(NewExecution {
            kind: taskmesh_common::model::ExecutionKind::Script,
            mode: None,
            parent: None,
            plan_ref: None,
            script_ref: None,
            variables_snapshot: json!({}),
            owner: "acme".to_string(),
        })
        .await
        .unwrap();
    let task_id = TaskId::new_v4();
    tasks
        .create(NewTask {
            id: task_id,
            execution_ref: execution.id,
            priority: Priority::Normal,
            payload: serde_json::to_value(payload(task_id, execution.id)).unwrap(),
        })
        .await
        .unwrap();

    for _ in 0..2 {
        result_handler
            .record(TaskResult {
                task_id,
                outcome: TaskOutcome::Completed,
                result: json!({"message": "ok"}),
                error: None,
            })
            .await
            .unwrap();
    }

    let execution = executions.find(execution.id).await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.result.unwrap()["message"], "ok");
}

#[tokio::test]
async fn stop_is_terminal_for_pending_children() {
    let store = store().await;
    let executions = ExecutionRepo::new(store.pool.clone());
    let tasks = TaskRepo::new(store.pool.clone());
    let workers = WorkerRepo::new(store.pool.clone());
    let stop_controller = StopController::new(executions.clone(), tasks.clone(), workers.clone());

    let parent = executions
        .create(NewExecution {
            kind: taskmesh_common::model::ExecutionKind::Plan,
            mode: Some(taskmesh_common::model::ExecutionMode::Sequential),
            parent: None,
            plan_ref: None,
            script_ref: None,
            variables_snapshot: json!({}),
            owner: "acme".to_string(),
        })
        .await
        .unwrap();
    let child = executions
        .create(NewExecution {
            kind: taskmesh_common::model::ExecutionKind::Script,
            mode: None,
            parent: Some(parent.id),
            plan_ref: None,
            script_ref: None,
            variables_snapshot: json!({}),
            owner: "acme".to_string(),
        })
        .await
        .unwrap();
    let task_id = TaskId::new_v4();
    tasks
        .create(NewTask {
            id: task_id,
            execution_ref: child.id,
            priority: Priority::Normal,
            payload: serde_json::to_value(payload(task_id, child.id)).unwrap(),
        })
        .await
        .unwrap();

    stop_controller.stop(parent.id).await.unwrap();

    let child = executions.find(child.id).await.unwrap().unwrap();
    assert_eq!(child.state, ExecutionState::Stopped);
    let task = tasks.find(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Cancelled);

    // A second stop is rejected since the execution is already terminal.
    assert!(stop_controller.stop(parent.id).await.is_err());
}
