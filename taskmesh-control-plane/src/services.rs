//! Wires the repos, the broker adapter, the script catalog client and the
//! C3-C6 services together into one injectable bundle, following §9's
//! "global singletons → injected collaborators" design note: every
//! collaborator here is a trait object a test can substitute.

use crate::catalog_client::HttpScriptCatalog;
use crate::config::ControlPlaneConfig;
use crate::repo::{ExecutionRepo, StatusLogRepo, TaskRepo, VariableRepo, WorkerRepo};
use crate::service::aggregator::NoopReportHook;
use crate::service::{
    Dispatcher, ExecutionService, PlanAggregator, ResultHandler, ScreenshotService, StopController,
    WorkerRegistrar,
};
use std::sync::Arc;
use taskmesh_broker::{AmqpBroker, Broker};
use taskmesh_common::clock::{Clock, SystemClock};
use taskmesh_service_base::db::Pool;

#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub executions: ExecutionRepo,
    pub tasks: TaskRepo,
    pub workers: WorkerRepo,
    pub variables: VariableRepo,
    pub status_log: StatusLogRepo,
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Dispatcher,
    pub aggregator: PlanAggregator,
    pub stop_controller: StopController,
    pub registrar: WorkerRegistrar,
    pub result_handler: ResultHandler,
    pub execution_service: ExecutionService,
    pub screenshot_service: ScreenshotService,
    pub config: ControlPlaneConfig,
}

impl Services {
    pub async fn new(config: &ControlPlaneConfig) -> anyhow::Result<Self> {
        let pool = Pool::configured(&config.db).await?;
        let migrator = crate::db::migrator_for(&config.db);
        taskmesh_service_base::migration::run_migrations(&pool, migrator).await?;

        Self::from_pool(pool, config, Arc::new(AmqpBroker::new(config.broker.clone()))).await
    }

    /// Used by tests and by `Services::new` alike, with the broker
    /// implementation injected so tests can pass `FakeBroker` without a
    /// real AMQP server (§9).
    pub async fn from_pool(
        pool: Pool,
        config: &ControlPlaneConfig,
        broker: Arc<dyn Broker>,
    ) -> anyhow::Result<Self> {
        let executions = ExecutionRepo::new(pool.clone());
        let tasks = TaskRepo::new(pool.clone());
        let workers = WorkerRepo::new(pool.clone());
        let variables = VariableRepo::new(pool.clone());
        let status_log = StatusLogRepo::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let dispatcher = Dispatcher::new(
            pool.clone(),
            executions.clone(),
            tasks.clone(),
            workers.clone(),
            broker.clone(),
            clock.clone(),
        );

        let aggregator = PlanAggregator::new(executions.clone(), Arc::new(NoopReportHook));

        let stop_controller = StopController::new(executions.clone(), tasks.clone(), workers.clone());

        let registrar = WorkerRegistrar::new(workers.clone(), tasks.clone(), status_log.clone());

        let result_handler = ResultHandler::new(
            executions.clone(),
            tasks.clone(),
            workers.clone(),
            aggregator.clone(),
            dispatcher.clone(),
        );

        let catalog = Arc::new(HttpScriptCatalog::new(config.script_catalog.clone())?);
        let execution_service = ExecutionService::new(
            executions.clone(),
            tasks.clone(),
            variables.clone(),
            catalog,
            dispatcher.clone(),
        );

        let screenshot_service =
            crate::service::ScreenshotService::new(tasks.clone(), executions.clone(), config.media_root.clone());

        Ok(Self {
            pool,
            executions,
            tasks,
            workers,
            variables,
            status_log,
            broker,
            clock,
            dispatcher,
            aggregator,
            stop_controller,
            registrar,
            result_handler,
            execution_service,
            screenshot_service,
            config: config.clone(),
        })
    }

    /// The periodic tick from §4.1's "called on (iii) a periodic tick".
    /// Spawned by `server.rs` on `dispatch.tick_interval_ms`.
    pub async fn run_dispatch_tick(&self) {
        match self.dispatcher.dispatch(self.config.dispatch.batch_limit).await {
            Ok(bound) if bound > 0 => tracing::debug!(bound, "periodic dispatch tick bound tasks"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "periodic dispatch tick failed"),
        }
    }

    /// §10.6's status-log retention prune, run on a timer independent of
    /// the heartbeat cadence.
    pub async fn run_status_log_prune(&self) {
        match self.status_log.prune_older_than(self.config.status_log_retention_days).await {
            Ok(removed) if removed > 0 => tracing::debug!(removed, "pruned status log"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "status log prune failed"),
        }
    }
}
