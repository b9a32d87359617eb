//! C5 — the plan aggregator. Recomputes a parent plan's status whenever one
//! of its children reaches a terminal result (§4.5).

use crate::repo::ExecutionRepo;
use serde_json::json;
use taskmesh_common::ids::ExecutionId;
use taskmesh_common::model::ExecutionState;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
}

impl SafeDisplay for AggregatorError {
    fn to_safe_string(&self) -> String {
        "plan aggregation failed".to_string()
    }
}

/// Invoked after a report-generation hook so failures there never block the
/// state transition the aggregator just committed (§4.5).
#[async_trait::async_trait]
pub trait ReportHook: Send + Sync {
    async fn on_plan_terminal(&self, parent: ExecutionId);
}

pub struct NoopReportHook;

#[async_trait::async_trait]
impl ReportHook for NoopReportHook {
    async fn on_plan_terminal(&self, _parent: ExecutionId) {}
}

#[derive(Clone)]
pub struct PlanAggregator {
    executions: ExecutionRepo,
    report_hook: std::sync::Arc<dyn ReportHook>,
}

impl PlanAggregator {
    pub fn new(executions: ExecutionRepo, report_hook: std::sync::Arc<dyn ReportHook>) -> Self {
        Self {
            executions,
            report_hook,
        }
    }

    /// §4.5: reads every child of `parent`, recomputes aggregate counts, and
    /// writes the new parent state. A child still in flight keeps the
    /// parent `running`; once none are, any failure makes the whole plan
    /// `failed` — partial success is still failure (§9 open question,
    /// preserved as specified).
    pub async fn recompute(&self, parent: ExecutionId) -> Result<(), AggregatorError> {
        let Some(parent_execution) = self.executions.find(parent).await? else {
            return Ok(());
        };
        if parent_execution.state == ExecutionState::Stopped {
            // A stopped plan's aggregate state is final; a late sibling
            // result must not resurrect it (§8 property 3).
            return Ok(());
        }

        let children = self.executions.children(parent).await?;
        let running = children
            .iter()
            .filter(|c| matches!(c.state, ExecutionState::Pending | ExecutionState::Running))
            .count();
        let failed = children.iter().filter(|c| c.state == ExecutionState::Failed).count();
        let completed = children.iter().filter(|c| c.state == ExecutionState::Completed).count();

        let new_state = if running > 0 {
            ExecutionState::Running
        } else if failed == 0 {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };

        if new_state == parent_execution.state {
            return Ok(());
        }

        self.executions.set_state(None, parent, new_state).await?;
        self.executions
            .set_result(
                parent,
                json!({
                    "total": children.len(),
                    "completed": completed,
                    "failed": failed,
                    "running": running,
                }),
            )
            .await?;

        info!(parent = %parent, state = %new_state, "plan aggregated");

        if new_state.is_terminal() {
            self.report_hook.on_plan_terminal(parent).await;
        }

        Ok(())
    }
}
