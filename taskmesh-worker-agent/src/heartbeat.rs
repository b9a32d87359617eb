//! C8 — the worker heartbeat loop (§4.8). Runs on its own tick, independent
//! of the intake loop: scans `running_tasks` for parents not already known
//! stopped, polls `status_check` for each, trims the stopped-cache once it
//! grows past 10 entries, samples resources, and POSTs a heartbeat. None of
//! this ever touches the broker channel (§5: "the broker channel is used
//! from the intake thread only").

use crate::control_plane_client::{ControlPlaneClient, HeartbeatReport};
use crate::resource::ResourceSampler;
use crate::running_tasks::RunningTasks;
use crate::stopped_cache::StoppedCache;
use std::sync::Arc;
use taskmesh_common::ids::WorkerId;
use tracing::{debug, warn};

pub struct HeartbeatLoop {
    worker_id: WorkerId,
    control_plane: Arc<dyn ControlPlaneClient>,
    running_tasks: Arc<RunningTasks>,
    stopped_cache: Arc<StoppedCache>,
    resource_sampler: Arc<ResourceSampler>,
    interval: std::time::Duration,
}

impl HeartbeatLoop {
    pub fn new(
        worker_id: WorkerId,
        control_plane: Arc<dyn ControlPlaneClient>,
        running_tasks: Arc<RunningTasks>,
        stopped_cache: Arc<StoppedCache>,
        resource_sampler: Arc<ResourceSampler>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            worker_id,
            control_plane,
            running_tasks,
            stopped_cache,
            resource_sampler,
            interval,
        }
    }

    /// Runs forever, once every `interval`. Never returns an error — every
    /// failure along the way is logged and the loop just waits for its next
    /// tick, per §4.8 step 4's "exceptions are logged, never fatal".
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        self.scan_parents_for_stop().await;

        let referenced = self.running_tasks.referenced_parents();
        self.stopped_cache.trim_to_referenced(&referenced);

        let snapshot = self.resource_sampler.sample();
        let state = if self.running_tasks.is_empty() { "online" } else { "busy" };

        let report = HeartbeatReport {
            uuid: self.worker_id,
            state: state.to_string(),
            current_tasks: self.running_tasks.len() as u32,
            cpu_usage: snapshot.cpu_usage,
            memory_usage: snapshot.memory_usage,
            disk_usage: snapshot.disk_usage,
            message: None,
        };

        match self.control_plane.heartbeat(report).await {
            Ok(ack) => debug!(pending_tasks = ack.pending_tasks, "heartbeat sent"),
            Err(err) => warn!(error = %err, "heartbeat POST failed"),
        }
    }

    /// §4.8 steps 1-2: distinct parents not already known stopped, each
    /// checked live and cached if the control plane reports them stopped.
    async fn scan_parents_for_stop(&self) {
        let stopped_cache = &self.stopped_cache;
        let parents = self
            .running_tasks
            .distinct_parents_excluding(|id| stopped_cache.contains(id));

        for parent in parents {
            match self.control_plane.status_check(parent).await {
                Ok(check) if check.is_stopped() => {
                    self.stopped_cache.insert(parent);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(execution_id = %parent, error = %err, "heartbeat-loop status check failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane_client::{HeartbeatAck, RegisterRequest, StatusCheck};
    use crate::error::ControlPlaneError;
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;
    use std::sync::Mutex as StdMutex;
    use taskmesh_common::ids::{ExecutionId, TaskId};

    #[derive(Default)]
    struct RecordingControlPlane {
        stopped: StdHashSet<ExecutionId>,
        heartbeats: StdMutex<Vec<HeartbeatReport>>,
    }

    #[async_trait]
    impl ControlPlaneClient for RecordingControlPlane {
        async fn register(&self, _req: RegisterRequest) -> Result<WorkerId, ControlPlaneError> {
            Ok(WorkerId::new_v4())
        }
        async fn heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatAck, ControlPlaneError> {
            self.heartbeats.lock().unwrap().push(report);
            Ok(HeartbeatAck { pending_tasks: 0 })
        }
        async fn status_check(&self, execution_id: ExecutionId) -> Result<StatusCheck, ControlPlaneError> {
            Ok(StatusCheck {
                status: if self.stopped.contains(&execution_id) { "stopped" } else { "running" }.to_string(),
                is_valid: true,
            })
        }
        async fn post_result(
            &self,
            _task_id: TaskId,
            _report: crate::control_plane_client::TaskResultReport,
        ) -> Result<(), ControlPlaneError> {
            Ok(())
        }
        async fn post_screenshot(&self, _task_id: TaskId, _image_data: String, _is_failure: bool) -> Result<String, ControlPlaneError> {
            Ok(String::new())
        }
        async fn nudge_dispatch(&self) {}
    }

    #[tokio::test]
    async fn tick_caches_a_parent_the_control_plane_reports_stopped() {
        let parent = ExecutionId::new_v4();
        let mut control_plane = RecordingControlPlane::default();
        control_plane.stopped.insert(parent);
        let control_plane = Arc::new(control_plane);

        let running_tasks = Arc::new(RunningTasks::new());
        running_tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), Some(parent));

        let stopped_cache = Arc::new(StoppedCache::new());
        let heartbeat = HeartbeatLoop::new(
            WorkerId::new_v4(),
            control_plane.clone(),
            running_tasks,
            stopped_cache.clone(),
            Arc::new(ResourceSampler::new()),
            std::time::Duration::from_secs(30),
        );

        heartbeat.tick().await;

        assert!(stopped_cache.contains(parent));
        assert_eq!(control_plane.heartbeats.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tick_reports_current_tasks_count_and_busy_state() {
        let control_plane = Arc::new(RecordingControlPlane::default());
        let running_tasks = Arc::new(RunningTasks::new());
        running_tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), None);

        let heartbeat = HeartbeatLoop::new(
            WorkerId::new_v4(),
            control_plane.clone(),
            running_tasks,
            Arc::new(StoppedCache::new()),
            Arc::new(ResourceSampler::new()),
            std::time::Duration::from_secs(30),
        );

        heartbeat.tick().await;

        let heartbeats = control_plane.heartbeats.lock().unwrap();
        assert_eq!(heartbeats[0].current_tasks, 1);
        assert_eq!(heartbeats[0].state, "busy");
    }
}
