//! C10 — the per-parent wait FIFO for sequential-mode siblings that arrive
//! while one of their own is already running on this worker (§4.7 step 4,
//! §4.10). A single mutex guards every parent's queue, matching §5's "the
//! sequential wait-FIFOs share one lock".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use taskmesh_broker::TaskPayload;
use taskmesh_common::ids::ExecutionId;

#[derive(Default)]
pub struct SequentialQueue {
    inner: Mutex<HashMap<ExecutionId, VecDeque<TaskPayload>>>,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.7 step 4: the delivery was already acked by the broker adapter —
    /// this queue is the only thing holding onto it now.
    pub fn push(&self, parent: ExecutionId, payload: TaskPayload) {
        self.inner.lock().unwrap().entry(parent).or_default().push_back(payload);
    }

    /// §4.10's drain rule: pop the next payload queued for `parent`, in
    /// broker-arrival order.
    pub fn pop(&self, parent: ExecutionId) -> Option<TaskPayload> {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.get_mut(&parent)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            inner.remove(&parent);
        }
        next
    }

    pub fn len_for(&self, parent: ExecutionId) -> usize {
        self.inner.lock().unwrap().get(&parent).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use taskmesh_broker::ScriptData;
    use taskmesh_common::ids::{ScriptId, TaskId};

    fn payload(task: TaskId) -> TaskPayload {
        TaskPayload {
            task_id: task,
            execution_id: ExecutionId::new_v4(),
            browser_type: "chromium".to_string(),
            timeout: 60,
            variables: Map::new(),
            script_data: ScriptData {
                script_id: ScriptId::new_v4(),
                name: "s".to_string(),
                description: String::new(),
                script_type: "ui".to_string(),
                framework: "playwright".to_string(),
                steps: vec![],
                variables: Map::new(),
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

    #[test]
    fn pops_in_arrival_order() {
        let queue = SequentialQueue::new();
        let parent = ExecutionId::new_v4();
        let first = TaskId::new_v4();
        let second = TaskId::new_v4();

        queue.push(parent, payload(first));
        queue.push(parent, payload(second));
        assert_eq!(queue.len_for(parent), 2);

        assert_eq!(queue.pop(parent).unwrap().task_id, first);
        assert_eq!(queue.pop(parent).unwrap().task_id, second);
        assert!(queue.pop(parent).is_none());
        assert_eq!(queue.len_for(parent), 0);
    }
}
