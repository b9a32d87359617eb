//! Execution creation and the status-check read path. Resolving a
//! `plan_id`/`script_id` into concrete steps is the one place the core
//! touches the out-of-scope CRUD surface (§1); it does so through the
//! injected [`ScriptCatalog`] collaborator rather than a local table, per
//! §9's "global singletons → injected collaborators" design note.

use crate::model::Execution;
use crate::repo::execution::NewExecution;
use crate::repo::task::NewTask;
use crate::repo::{ExecutionRepo, TaskRepo, VariableRepo};
use crate::service::dispatcher::{build_payload, Dispatcher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use taskmesh_broker::{PlanScript, ScriptData as WireScriptData, Step};
use taskmesh_common::ids::{ExecutionId, PlanId, ProjectId, ScriptId};
use taskmesh_common::model::{ExecutionKind, ExecutionMode, ExecutionState, Priority};
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::repo::RepoError;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ScriptSpec {
    pub id: ScriptId,
    pub name: String,
    pub description: String,
    pub script_type: String,
    pub framework: String,
    pub steps: Vec<Step>,
    pub variables: HashMap<String, Json>,
    pub timeout: u64,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone)]
pub struct PlanSpec {
    pub name: String,
    pub mode: ExecutionMode,
    pub scripts: Vec<ScriptSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("script {0} not found")]
    ScriptNotFound(ScriptId),
    #[error("plan {0} not found")]
    PlanNotFound(PlanId),
    #[error("catalog request failed: {0}")]
    Transport(String),
}

/// The out-of-scope HTTP CRUD surface, touched only here. Tests substitute
/// an in-memory fake; production would call the scripts/plans service.
#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    async fn fetch_script(&self, id: ScriptId) -> Result<ScriptSpec, CatalogError>;
    async fn fetch_plan(&self, id: PlanId) -> Result<PlanSpec, CatalogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("storage error: {0}")]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("execution {0} not found")]
    NotFound(ExecutionId),
    #[error("request must set exactly one of plan_id or script_id")]
    AmbiguousTarget,
    #[error("dispatch after create failed: {0}")]
    Dispatch(#[from] crate::service::dispatcher::DispatchError),
}

impl SafeDisplay for ExecutionError {
    fn to_safe_string(&self) -> String {
        match self {
            ExecutionError::NotFound(_) => "execution not found".to_string(),
            ExecutionError::AmbiguousTarget => {
                "request must set exactly one of plan_id or script_id".to_string()
            }
            _ => "execution creation failed".to_string(),
        }
    }
}

pub struct CreateExecutionRequest {
    pub plan_id: Option<PlanId>,
    pub script_id: Option<ScriptId>,
    pub execution_mode: Option<ExecutionMode>,
    pub owner: String,
    pub variables: HashMap<String, Json>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheck {
    pub state: ExecutionState,
    pub is_valid: bool,
}

#[derive(Clone)]
pub struct ExecutionService {
    executions: ExecutionRepo,
    tasks: TaskRepo,
    variables: VariableRepo,
    catalog: std::sync::Arc<dyn ScriptCatalog>,
    dispatcher: Dispatcher,
}

impl ExecutionService {
    pub fn new(
        executions: ExecutionRepo,
        tasks: TaskRepo,
        variables: VariableRepo,
        catalog: std::sync::Arc<dyn ScriptCatalog>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            executions,
            tasks,
            variables,
            catalog,
            dispatcher,
        }
    }

    pub async fn find(&self, id: ExecutionId) -> Result<Execution, ExecutionError> {
        self.executions.find(id).await?.ok_or(ExecutionError::NotFound(id))
    }

    /// `GET /executions/{id}/status_check`, unauthenticated — the pull side
    /// of the stop protocol (§4.4, §4.6 step 3).
    pub async fn status_check(&self, id: ExecutionId) -> Result<StatusCheck, ExecutionError> {
        let execution = self.find(id).await?;
        Ok(StatusCheck {
            state: execution.state,
            is_valid: execution.state == ExecutionState::Running,
        })
    }

    /// `POST /executions`: creates an execution (plus children for a plan)
    /// and nudges the dispatcher (§6).
    pub async fn create(&self, req: CreateExecutionRequest) -> Result<Execution, ExecutionError> {
        match (req.plan_id, req.script_id) {
            (Some(plan_id), None) => self.create_plan(plan_id, req.execution_mode, req.owner, req.variables).await,
            (None, Some(script_id)) => self.create_script(script_id, req.owner, req.variables).await,
            _ => Err(ExecutionError::AmbiguousTarget),
        }
    }

    async fn create_script(
        &self,
        script_id: ScriptId,
        owner: String,
        variables: HashMap<String, Json>,
    ) -> Result<Execution, ExecutionError> {
        let spec = self.catalog.fetch_script(script_id).await?;
        let merged_variables = self.merge_variables(spec.project_id, script_id, variables).await?;

        let execution = self
            .executions
            .create(NewExecution {
                kind: ExecutionKind::Script,
                mode: None,
                parent: None,
                plan_ref: None,
                script_ref: Some(script_id),
                variables_snapshot: json!(merged_variables),
                owner,
            })
            .await?;

        self.create_task_for_script(&execution, &spec, &merged_variables, None, None, None, None, vec![])
            .await?;

        self.dispatcher.dispatch(50).await?;
        Ok(execution)
    }

    async fn create_plan(
        &self,
        plan_id: PlanId,
        execution_mode: Option<ExecutionMode>,
        owner: String,
        variables: HashMap<String, Json>,
    ) -> Result<Execution, ExecutionError> {
        let spec = self.catalog.fetch_plan(plan_id).await?;
        let mode = execution_mode.unwrap_or(spec.mode);

        let parent = self
            .executions
            .create(NewExecution {
                kind: ExecutionKind::Plan,
                mode: Some(mode),
                parent: None,
                plan_ref: Some(plan_id),
                script_ref: None,
                variables_snapshot: json!(variables),
                owner: owner.clone(),
            })
            .await?;

        let plan_scripts: Vec<PlanScript> = spec
            .scripts
            .iter()
            .enumerate()
            .map(|(i, s)| PlanScript {
                index: i as u32,
                name: s.name.clone(),
            })
            .collect();
        let total_scripts = spec.scripts.len() as u32;

        for (index, script) in spec.scripts.iter().enumerate() {
            let merged_variables = self
                .merge_variables(script.project_id, script.id, variables.clone())
                .await?;

            let child = self
                .executions
                .create(NewExecution {
                    kind: ExecutionKind::Script,
                    mode: None,
                    parent: Some(parent.id),
                    plan_ref: None,
                    script_ref: Some(script.id),
                    variables_snapshot: json!(merged_variables),
                    owner: owner.clone(),
                })
                .await?;

            self.create_task_for_script(
                &child,
                script,
                &merged_variables,
                Some(parent.id),
                Some(mode),
                Some(index as u32),
                Some(total_scripts),
                plan_scripts.clone(),
            )
            .await?;
        }

        self.dispatcher.dispatch(50).await?;
        Ok(parent)
    }

    async fn merge_variables(
        &self,
        project_id: Option<ProjectId>,
        script_id: ScriptId,
        request_overrides: HashMap<String, Json>,
    ) -> Result<HashMap<String, Json>, ExecutionError> {
        let merged = self
            .variables
            .merged(project_id.map(|p| p.to_string()).as_deref(), &script_id.to_string())
            .await?;
        let mut result: HashMap<String, Json> = merged.into_iter().map(|(k, v)| (k, Json::String(v))).collect();
        result.extend(request_overrides);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_task_for_script(
        &self,
        execution: &Execution,
        spec: &ScriptSpec,
        variables: &HashMap<String, Json>,
        parent_execution_id: Option<ExecutionId>,
        mode: Option<ExecutionMode>,
        script_index: Option<u32>,
        total_scripts: Option<u32>,
        plan_scripts: Vec<PlanScript>,
    ) -> Result<(), ExecutionError> {
        let wire_script_data = WireScriptData {
            script_id: spec.id,
            name: spec.name.clone(),
            description: spec.description.clone(),
            script_type: spec.script_type.clone(),
            framework: spec.framework.clone(),
            steps: spec.steps.clone(),
            variables: spec.variables.clone(),
            timeout: spec.timeout,
            project_id: spec.project_id.map(|p| p.to_string()),
        };

        let task_id = taskmesh_common::ids::TaskId::new_v4();
        let payload = build_payload(
            "chromium",
            task_id,
            execution.id,
            spec.timeout,
            variables.clone(),
            wire_script_data,
            parent_execution_id,
            mode,
            script_index,
            total_scripts,
            plan_scripts,
        );

        let created = self
            .tasks
            .create(NewTask {
                id: task_id,
                execution_ref: execution.id,
                priority: Priority::Normal,
                payload: serde_json::to_value(&payload).unwrap(),
            })
            .await?;

        info!(execution_id = %execution.id, task_id = %created.id, "task created");
        Ok(())
    }
}
