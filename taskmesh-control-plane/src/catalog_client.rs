//! HTTP implementation of [`crate::service::execution::ScriptCatalog`] against
//! the out-of-scope scripts/plans CRUD service (§1), built the way
//! `taskmesh-service-base::clients::RemoteServiceConfig` is meant to be used.

use crate::service::execution::{CatalogError, PlanSpec, ScriptCatalog, ScriptSpec};
use async_trait::async_trait;
use serde::Deserialize;
use taskmesh_broker::Step;
use taskmesh_common::ids::{PlanId, ProjectId, ScriptId};
use taskmesh_common::model::ExecutionMode;
use taskmesh_service_base::clients::RemoteServiceConfig;

#[derive(Deserialize)]
struct ScriptDto {
    id: ScriptId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    script_type: String,
    framework: String,
    steps: Vec<Step>,
    #[serde(default)]
    variables: std::collections::HashMap<String, serde_json::Value>,
    timeout: u64,
    project_id: Option<ProjectId>,
}

impl From<ScriptDto> for ScriptSpec {
    fn from(dto: ScriptDto) -> Self {
        ScriptSpec {
            id: dto.id,
            name: dto.name,
            description: dto.description,
            script_type: dto.script_type,
            framework: dto.framework,
            steps: dto.steps,
            variables: dto.variables,
            timeout: dto.timeout,
            project_id: dto.project_id,
        }
    }
}

#[derive(Deserialize)]
struct PlanDto {
    name: String,
    mode: ExecutionMode,
    scripts: Vec<ScriptDto>,
}

pub struct HttpScriptCatalog {
    client: reqwest::Client,
    config: RemoteServiceConfig,
}

impl HttpScriptCatalog {
    pub fn new(config: RemoteServiceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: config.client()?,
            config,
        })
    }
}

#[async_trait]
impl ScriptCatalog for HttpScriptCatalog {
    async fn fetch_script(&self, id: ScriptId) -> Result<ScriptSpec, CatalogError> {
        let url = self.config.base_url.join(&format!("scripts/{id}")).map_err(|e| {
            CatalogError::Transport(e.to_string())
        })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::ScriptNotFound(id));
        }
        let dto: ScriptDto = response
            .error_for_status()
            .map_err(|e| CatalogError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        Ok(dto.into())
    }

    async fn fetch_plan(&self, id: PlanId) -> Result<PlanSpec, CatalogError> {
        let url = self
            .config
            .base_url
            .join(&format!("plans/{id}"))
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::PlanNotFound(id));
        }
        let dto: PlanDto = response
            .error_for_status()
            .map_err(|e| CatalogError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;

        Ok(PlanSpec {
            name: dto.name,
            mode: dto.mode,
            scripts: dto.scripts.into_iter().map(Into::into).collect(),
        })
    }
}
