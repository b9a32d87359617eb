//! Wires the leaf modules (C7-C11) into one injectable bundle, the worker
//! side's analog of the control plane's `Services` (§9's "global singletons
//! → injected collaborators").

use crate::config::WorkerConfig;
use crate::control_plane_client::{ControlPlaneClient, RegisterRequest};
use crate::heartbeat::HeartbeatLoop;
use crate::intake::IntakeLoop;
use crate::resource::ResourceSampler;
use crate::running_tasks::RunningTasks;
use crate::runner::Runner;
use crate::sequential_queue::SequentialQueue;
use crate::step_executor::BrowserFactory;
use crate::stopped_cache::{PlanHistory, StoppedCache};
use std::sync::Arc;
use taskmesh_broker::Broker;
use taskmesh_common::retry::{retry_with_backoff, BackoffPolicy};
use tracing::{info, warn};

pub struct WorkerAgent {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    control_plane: Arc<dyn ControlPlaneClient>,
    running_tasks: Arc<RunningTasks>,
    stopped_cache: Arc<StoppedCache>,
    plan_history: Arc<PlanHistory>,
    sequential_queue: Arc<SequentialQueue>,
    runner: Arc<Runner>,
    resource_sampler: Arc<ResourceSampler>,
}

impl WorkerAgent {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        control_plane: Arc<dyn ControlPlaneClient>,
        browser_factory: Arc<dyn BrowserFactory>,
    ) -> Arc<Self> {
        let running_tasks = Arc::new(RunningTasks::new());
        let stopped_cache = Arc::new(StoppedCache::new());
        let plan_history = Arc::new(PlanHistory::new());
        let sequential_queue = Arc::new(SequentialQueue::new());

        let runner = Runner::new(
            control_plane.clone(),
            browser_factory,
            running_tasks.clone(),
            stopped_cache.clone(),
            plan_history.clone(),
            sequential_queue.clone(),
            config.max_concurrent,
        );

        Arc::new(Self {
            config,
            broker,
            control_plane,
            running_tasks,
            stopped_cache,
            plan_history,
            sequential_queue,
            runner,
            resource_sampler: Arc::new(ResourceSampler::new()),
        })
    }

    pub fn plan_history(&self) -> &Arc<PlanHistory> {
        &self.plan_history
    }

    /// Registers with the control plane, retrying with backoff (§5:
    /// "registration POST 10s with 5 retries and exponential backoff").
    /// Called once before `run` by the binary entrypoint.
    pub async fn register(&self) -> anyhow::Result<()> {
        let request = RegisterRequest {
            executor_uuid: self.config.executor_uuid,
            executor_name: self.config.executor_name.clone(),
            platform: Some(std::env::consts::OS.to_string()),
            browser_types: vec![self.config.default_browser.clone()],
            owner_username: self.config.owner_username.clone(),
        };

        retry_with_backoff(BackoffPolicy::registration(), || {
            let request = request.clone();
            async move {
                self.control_plane.register(request).await.map_err(|err| {
                    warn!(error = %err, "registration attempt failed");
                    err
                })
            }
        })
        .await?;

        self.broker.declare_worker_queue(self.config.executor_uuid).await?;
        info!(executor_uuid = %self.config.executor_uuid, "registered with control plane");
        Ok(())
    }

    /// SPEC_FULL §10.6's `--purge` flag: drops whatever is already sitting
    /// in this worker's own queue before it starts consuming. Operator
    /// recovery from a poisoned queue; never called automatically.
    pub async fn purge_own_queue(&self) -> anyhow::Result<u32> {
        let purged = self.broker.purge_worker_queue(self.config.executor_uuid).await?;
        info!(purged, executor_uuid = %self.config.executor_uuid, "purged worker queue");
        Ok(purged)
    }

    /// Runs the intake loop (C7) until the broker connection is exhausted,
    /// reconnecting with backoff across disconnects — `worker.rs`'s own
    /// retry loop around the broker stream itself.
    pub async fn run_intake(&self) {
        let intake = IntakeLoop::new(
            self.broker.clone(),
            self.config.executor_uuid,
            self.control_plane.clone(),
            self.runner.clone(),
            self.running_tasks.clone(),
            self.stopped_cache.clone(),
            self.sequential_queue.clone(),
            self.config.max_concurrent,
        );

        loop {
            match intake.run().await {
                Ok(()) => warn!("intake loop ended, reconnecting"),
                Err(err) => warn!(error = %err, "intake loop failed, reconnecting"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    /// Runs the heartbeat loop (C8) forever at `config.heartbeat_interval`.
    pub async fn run_heartbeat(&self) {
        let heartbeat = HeartbeatLoop::new(
            self.config.executor_uuid,
            self.control_plane.clone(),
            self.running_tasks.clone(),
            self.stopped_cache.clone(),
            self.resource_sampler.clone(),
            self.config.heartbeat_interval,
        );
        heartbeat.run().await;
    }
}
