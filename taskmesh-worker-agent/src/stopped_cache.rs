//! C11 — the stopped-execution cache, plus the per-worker `plan_executions`
//! view it's specified alongside (§4.11). Both are bounded, FIFO-evicted,
//! lock-guarded maps consulted before any network call so a broker storm of
//! a stopped plan's siblings doesn't turn into a storm of status-check
//! requests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use taskmesh_common::ids::ExecutionId;

const STOPPED_CACHE_CAPACITY: usize = 100;
const STOPPED_CACHE_TRIM_THRESHOLD: usize = 10;
const PLAN_HISTORY_CAPACITY: usize = 50;

/// Bounded set of parent execution ids confirmed `stopped`. Max size 100,
/// FIFO eviction (oldest inserted first); consulted by C7's pre-check and
/// C9 step 1.
pub struct StoppedCache {
    inner: Mutex<Inner>,
}

struct Inner {
    order: VecDeque<ExecutionId>,
    set: HashSet<ExecutionId>,
}

impl Default for StoppedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StoppedCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
        }
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.inner.lock().unwrap().set.contains(&id)
    }

    /// Adds `id`, evicting the oldest entry if the cache is now over
    /// capacity. A re-insert of an already-cached id is a no-op — FIFO
    /// order is about insertion, not access.
    pub fn insert(&self, id: ExecutionId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.set.insert(id) {
            return;
        }
        inner.order.push_back(id);
        if inner.order.len() > STOPPED_CACHE_CAPACITY {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// §4.8 step 3: once the cache holds more than 10 entries, drop every
    /// entry whose parent id is no longer referenced by any currently
    /// running task, so a long-lived worker doesn't keep stop records for
    /// plans it finished draining long ago.
    pub fn trim_to_referenced(&self, referenced: &HashSet<ExecutionId>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.order.len() <= STOPPED_CACHE_TRIM_THRESHOLD {
            return;
        }
        let kept: VecDeque<ExecutionId> = inner.order.iter().copied().filter(|id| referenced.contains(id)).collect();
        inner.set = kept.iter().copied().collect();
        inner.order = kept;
    }
}

#[derive(Debug, Clone)]
pub struct PlanScriptView {
    pub index: u32,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct PlanView {
    pub plan_name: String,
    pub mode: String,
    pub scripts: Vec<PlanScriptView>,
}

/// The worker's own mirror of plan membership, so its local UI/logs can
/// show plan progress without round-tripping to the control plane. Bounded
/// at 50 historical plans, oldest dropped on insert.
pub struct PlanHistory {
    inner: Mutex<PlanHistoryInner>,
}

struct PlanHistoryInner {
    order: VecDeque<ExecutionId>,
    views: HashMap<ExecutionId, PlanView>,
}

impl Default for PlanHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanHistory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PlanHistoryInner {
                order: VecDeque::new(),
                views: HashMap::new(),
            }),
        }
    }

    pub fn record(&self, parent: ExecutionId, view: PlanView) {
        let mut inner = self.inner.lock().unwrap();
        if inner.views.insert(parent, view).is_none() {
            inner.order.push_back(parent);
            if inner.order.len() > PLAN_HISTORY_CAPACITY {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.views.remove(&evicted);
                }
            }
        }
    }

    pub fn update_script_state(&self, parent: ExecutionId, script_index: u32, state: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(view) = inner.views.get_mut(&parent) {
            if let Some(script) = view.scripts.iter_mut().find(|s| s.index == script_index) {
                script.state = state.to_string();
            }
        }
    }

    pub fn get(&self, parent: ExecutionId) -> Option<PlanView> {
        self.inner.lock().unwrap().views.get(&parent).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_cache_evicts_oldest_past_capacity() {
        let cache = StoppedCache::new();
        let ids: Vec<ExecutionId> = (0..STOPPED_CACHE_CAPACITY + 5).map(|_| ExecutionId::new_v4()).collect();
        for id in &ids {
            cache.insert(*id);
        }
        assert_eq!(cache.len(), STOPPED_CACHE_CAPACITY);
        assert!(!cache.contains(ids[0]));
        assert!(cache.contains(*ids.last().unwrap()));
    }

    #[test]
    fn re_inserting_a_cached_id_does_not_grow_the_cache() {
        let cache = StoppedCache::new();
        let id = ExecutionId::new_v4();
        cache.insert(id);
        cache.insert(id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn trim_drops_entries_no_longer_referenced_once_over_threshold() {
        let cache = StoppedCache::new();
        let kept = ExecutionId::new_v4();
        cache.insert(kept);
        for _ in 0..STOPPED_CACHE_TRIM_THRESHOLD {
            cache.insert(ExecutionId::new_v4());
        }
        assert!(cache.len() > STOPPED_CACHE_TRIM_THRESHOLD);

        let mut referenced = HashSet::new();
        referenced.insert(kept);
        cache.trim_to_referenced(&referenced);

        assert!(cache.contains(kept));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn trim_is_a_noop_below_threshold() {
        let cache = StoppedCache::new();
        let id = ExecutionId::new_v4();
        cache.insert(id);
        cache.trim_to_referenced(&HashSet::new());
        assert!(cache.contains(id));
    }

    #[test]
    fn plan_history_evicts_oldest_past_capacity() {
        let history = PlanHistory::new();
        let ids: Vec<ExecutionId> = (0..PLAN_HISTORY_CAPACITY + 3).map(|_| ExecutionId::new_v4()).collect();
        for id in &ids {
            history.record(
                *id,
                PlanView {
                    plan_name: "p".to_string(),
                    mode: "sequential".to_string(),
                    scripts: vec![],
                },
            );
        }
        assert_eq!(history.len(), PLAN_HISTORY_CAPACITY);
        assert!(history.get(ids[0]).is_none());
        assert!(history.get(*ids.last().unwrap()).is_some());
    }
}
