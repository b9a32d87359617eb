//! C7 — the worker intake loop (§4.7). Consumes the worker's bound queue one
//! delivery at a time (`prefetch_count = 1`, enforced by the broker adapter)
//! and, for each delivery, walks the pre-check/admission/sibling-gate chain
//! before either settling it immediately or handing it to the runner (C9),
//! which settles it once the task reaches a terminal state.

use crate::control_plane_client::ControlPlaneClient;
use crate::running_tasks::RunningTasks;
use crate::runner::Runner;
use crate::sequential_queue::SequentialQueue;
use crate::stopped_cache::StoppedCache;
use std::sync::Arc;
use taskmesh_broker::{Broker, BrokerError};
use taskmesh_common::ids::{ExecutionId, WorkerId};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

pub struct IntakeLoop {
    broker: Arc<dyn Broker>,
    worker_id: WorkerId,
    control_plane: Arc<dyn ControlPlaneClient>,
    runner: Arc<Runner>,
    running_tasks: Arc<RunningTasks>,
    stopped_cache: Arc<StoppedCache>,
    sequential_queue: Arc<SequentialQueue>,
    max_concurrent: u32,
}

impl IntakeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        worker_id: WorkerId,
        control_plane: Arc<dyn ControlPlaneClient>,
        runner: Arc<Runner>,
        running_tasks: Arc<RunningTasks>,
        stopped_cache: Arc<StoppedCache>,
        sequential_queue: Arc<SequentialQueue>,
        max_concurrent: u32,
    ) -> Self {
        Self {
            broker,
            worker_id,
            control_plane,
            runner,
            running_tasks,
            stopped_cache,
            sequential_queue,
            max_concurrent,
        }
    }

    /// Runs until the broker stream ends (connection dropped past
    /// reconnect exhaustion) or the process is torn down. `worker.rs` wraps
    /// this in its own retry loop across disconnects.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut deliveries = self.broker.consume(self.worker_id).await?;

        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => self.handle(delivery).await,
                // The broker already dropped the raw AMQP delivery without a
                // disposition when the body failed to parse as JSON — there
                // is no `Delivery` left here to ack or nack, so the only
                // thing left to do is log and move on to the next message.
                Err(BrokerError::InvalidPayload(reason)) => {
                    warn!(reason, "discarding a delivery that failed to parse");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn handle(&self, delivery: Box<dyn taskmesh_broker::Delivery>) {
        let payload = delivery.payload().clone();

        // Step 2: stop pre-check, cheapest first (local cache), then a
        // fresh status_check — for a plan child this checks both the parent
        // and the task's own execution id, since either can be stopped
        // independently of the other.
        let mut check_ids = vec![payload.execution_id];
        check_ids.extend(payload.parent_execution_id);
        for check_id in check_ids {
            if self.is_known_or_confirmed_stopped(check_id).await {
                debug!(task_id = %payload.task_id, execution_id = %check_id, "dropping delivery for a stopped execution");
                if let Err(err) = delivery.nack(false).await {
                    warn!(error = %err, "failed to nack a stopped-execution delivery");
                }
                return;
            }
        }

        // Step 3: admission against local capacity.
        if self.running_tasks.len() >= self.max_concurrent as usize {
            debug!(task_id = %payload.task_id, "at capacity, requeuing delivery");
            if let Err(err) = delivery.nack(true).await {
                warn!(error = %err, "failed to nack an over-capacity delivery");
            }
            return;
        }

        // Step 4: sequential-sibling gate — a parallel/standalone task has
        // no parent gating to do; a sequential plan child queues behind a
        // running sibling instead of occupying its own slot.
        if let Some(parent) = payload.parent_execution_id {
            if self.running_tasks.has_task_with_parent(parent) {
                debug!(task_id = %payload.task_id, %parent, "queuing behind a running sibling");
                self.sequential_queue.push(parent, payload);
                if let Err(err) = delivery.ack().await {
                    warn!(error = %err, "failed to ack a queued sequential-sibling delivery");
                }
                return;
            }
        }

        // Step 5: admit and hand off. The runner settles the delivery once
        // the task reaches a terminal state (it always acks, per §4.9 step
        // 7 — failures are reported as a `failed` result, not a nack).
        info!(task_id = %payload.task_id, "admitting task to the runner");
        self.runner.admit(payload);
        if let Err(err) = delivery.ack().await {
            warn!(error = %err, "failed to ack an admitted delivery");
        }
    }

    async fn is_known_or_confirmed_stopped(&self, check_id: ExecutionId) -> bool {
        if self.stopped_cache.contains(check_id) {
            return true;
        }
        match self.control_plane.status_check(check_id).await {
            Ok(check) if check.is_stopped() => {
                self.stopped_cache.insert(check_id);
                true
            }
            // §7: a transient control-plane error here just means the
            // delivery proceeds to admission; the runner re-checks before
            // it actually starts (§4.9 step 1).
            Ok(_) | Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane_client::{
        ControlPlaneClient, HeartbeatAck, HeartbeatReport, RegisterRequest, StatusCheck, TaskResultReport,
    };
    use crate::error::ControlPlaneError;
    use crate::step_executor::StubBrowserFactory;
    use crate::stopped_cache::PlanHistory;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use taskmesh_broker::ScriptData;
    use taskmesh_common::ids::{ExecutionId, ScriptId, TaskId};
    use taskmesh_test_support::fake_broker::{FakeBroker, Outcome};

    #[derive(Default)]
    struct NoopControlPlane {
        results: StdMutex<Vec<TaskResultReport>>,
    }

    #[async_trait]
    impl ControlPlaneClient for NoopControlPlane {
        async fn register(&self, _req: RegisterRequest) -> Result<WorkerId, ControlPlaneError> {
            Ok(WorkerId::new_v4())
        }
        async fn heartbeat(&self, _report: HeartbeatReport) -> Result<HeartbeatAck, ControlPlaneError> {
            Ok(HeartbeatAck { pending_tasks: 0 })
        }
        async fn status_check(&self, _execution_id: ExecutionId) -> Result<StatusCheck, ControlPlaneError> {
            Ok(StatusCheck {
                status: "running".to_string(),
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

    fn payload(parent: Option<ExecutionId>) -> TaskPayload {
        TaskPayload {
            task_id: TaskId::new_v4(),
            execution_id: ExecutionId::new_v4(),
            browser_type: "chromium".to_string(),
            timeout: 60,
            variables: HashMap::new(),
            script_data: ScriptData {
                script_id: ScriptId::new_v4(),
                name: "flow".to_string(),
                description: String::new(),
                script_type: "ui".to_string(),
                framework: "playwright".to_string(),
                steps: vec![],
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

    fn runner() -> Arc<Runner> {
        Runner::new(
            Arc::new(NoopControlPlane::default()),
            Arc::new(StubBrowserFactory),
            Arc::new(RunningTasks::new()),
            Arc::new(StoppedCache::new()),
            Arc::new(PlanHistory::new()),
            Arc::new(SequentialQueue::new()),
            2,
        )
    }

    #[tokio::test]
    async fn over_capacity_delivery_is_nacked_with_requeue() {
        let broker = FakeBroker::new();
        let worker_id = WorkerId::new_v4();
        let running_tasks = Arc::new(RunningTasks::new());
        running_tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), None);
        running_tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), None);

        let loop_ = IntakeLoop::new(
            Arc::new(broker.clone()),
            worker_id,
            Arc::new(NoopControlPlane::default()),
            runner(),
            running_tasks.clone(),
            Arc::new(StoppedCache::new()),
            Arc::new(SequentialQueue::new()),
            2,
        );

        let task = payload(None);
        let task_id = task.task_id;
        broker.publish(worker_id, &task).await.unwrap();

        let mut stream = broker.consume(worker_id).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        loop_.handle(delivery).await;

        assert!(broker.outcomes().contains(&Outcome::Nacked(task_id, true)));
    }

    #[tokio::test]
    async fn stopped_delivery_is_nacked_without_requeue_and_without_admitting() {
        let broker = FakeBroker::new();
        let worker_id = WorkerId::new_v4();
        let stopped_cache = Arc::new(StoppedCache::new());
        let execution_id = ExecutionId::new_v4();
        stopped_cache.insert(execution_id);

        let loop_ = IntakeLoop::new(
            Arc::new(broker.clone()),
            worker_id,
            Arc::new(NoopControlPlane::default()),
            runner(),
            Arc::new(RunningTasks::new()),
            stopped_cache,
            Arc::new(SequentialQueue::new()),
            2,
        );

        let mut task = payload(None);
        task.execution_id = execution_id;
        let task_id = task.task_id;
        broker.publish(worker_id, &task).await.unwrap();

        let mut stream = broker.consume(worker_id).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        loop_.handle(delivery).await;

        assert!(broker.outcomes().contains(&Outcome::Nacked(task_id, false)));
    }

    #[tokio::test]
    async fn sequential_sibling_is_acked_and_queued_not_admitted() {
        let broker = FakeBroker::new();
        let worker_id = WorkerId::new_v4();
        let running_tasks = Arc::new(RunningTasks::new());
        let parent = ExecutionId::new_v4();
        running_tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), Some(parent));

        let sequential_queue = Arc::new(SequentialQueue::new());
        let loop_ = IntakeLoop::new(
            Arc::new(broker.clone()),
            worker_id,
            Arc::new(NoopControlPlane::default()),
            runner(),
            running_tasks,
            Arc::new(StoppedCache::new()),
            sequential_queue.clone(),
            2,
        );

        let task = payload(Some(parent));
        let task_id = task.task_id;
        broker.publish(worker_id, &task).await.unwrap();

        let mut stream = broker.consume(worker_id).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        loop_.handle(delivery).await;

        assert!(broker.outcomes().contains(&Outcome::Acked(task_id)));
        assert_eq!(sequential_queue.len_for(parent), 1);
    }
}
