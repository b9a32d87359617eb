//! The worker's view of its own in-flight work: what C7 admits against
//! (`n = |running_tasks|`, §4.7 step 3), what C8 scans for distinct parents
//! (§4.8 step 1), and what C9 removes itself from on completion (§4.9 step
//! 6). A `dashmap` rather than a `Mutex<HashMap<..>>` since intake,
//! heartbeat and every runner goroutine touch it concurrently.

use dashmap::DashMap;
use std::collections::HashSet;
use taskmesh_common::ids::{ExecutionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    /// Placeholder inserted by C7 step 5 the instant a delivery is handed
    /// to a runner, before the runner has actually started the browser.
    Starting,
    Running,
}

#[derive(Debug, Clone)]
pub struct RunningTask {
    pub execution_id: ExecutionId,
    pub parent_execution_id: Option<ExecutionId>,
    pub status: RunningStatus,
}

#[derive(Default)]
pub struct RunningTasks {
    inner: DashMap<TaskId, RunningTask>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.inner.contains_key(&task_id)
    }

    pub fn insert_starting(&self, task_id: TaskId, execution_id: ExecutionId, parent_execution_id: Option<ExecutionId>) {
        self.inner.insert(
            task_id,
            RunningTask {
                execution_id,
                parent_execution_id,
                status: RunningStatus::Starting,
            },
        );
    }

    pub fn mark_running(&self, task_id: TaskId) {
        if let Some(mut entry) = self.inner.get_mut(&task_id) {
            entry.status = RunningStatus::Running;
        }
    }

    pub fn remove(&self, task_id: TaskId) -> Option<RunningTask> {
        self.inner.remove(&task_id).map(|(_, v)| v)
    }

    /// §4.8 step 1: distinct parent ids among everything currently running,
    /// skipping ones already confirmed stopped so the heartbeat loop
    /// doesn't re-check them every tick.
    pub fn distinct_parents_excluding(&self, already_known_stopped: impl Fn(ExecutionId) -> bool) -> Vec<ExecutionId> {
        let mut seen = HashSet::new();
        for entry in self.inner.iter() {
            if let Some(parent) = entry.value().parent_execution_id {
                if !already_known_stopped(parent) {
                    seen.insert(parent);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// All parent ids referenced by any running task, used by C11's
    /// stopped-cache trim (§4.8 step 3).
    pub fn referenced_parents(&self) -> HashSet<ExecutionId> {
        self.inner.iter().filter_map(|e| e.value().parent_execution_id).collect()
    }

    /// §4.7 step 4's sequential-sibling gate: is a task with this parent
    /// already occupying a slot on this worker?
    pub fn has_task_with_parent(&self, parent: ExecutionId) -> bool {
        self.inner.iter().any(|e| e.value().parent_execution_id == Some(parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_length_and_removal() {
        let tasks = RunningTasks::new();
        let task_id = TaskId::new_v4();
        let execution_id = ExecutionId::new_v4();
        tasks.insert_starting(task_id, execution_id, None);
        assert_eq!(tasks.len(), 1);
        assert!(tasks.contains(task_id));
        tasks.remove(task_id);
        assert!(tasks.is_empty());
    }

    #[test]
    fn has_task_with_parent_reflects_sibling_occupancy() {
        let tasks = RunningTasks::new();
        let parent = ExecutionId::new_v4();
        assert!(!tasks.has_task_with_parent(parent));
        tasks.insert_starting(TaskId::new_v4(), ExecutionId::new_v4(), Some(parent));
        assert!(tasks.has_task_with_parent(parent));
    }
}
