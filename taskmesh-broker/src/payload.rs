use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use taskmesh_common::ids::{ExecutionId, ScriptId, TaskId};
use taskmesh_common::model::ExecutionMode;

/// The JSON object placed on `tasks.exchange` with routing key
/// `executor.{uuid}` (§6). Field names and nesting match the wire contract
/// exactly since both the dispatcher and the worker agent serialize /
/// deserialize this same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub execution_id: ExecutionId,
    pub browser_type: String,
    pub timeout: u64,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub script_data: ScriptData,

    /// Present when this task is a plan child; drives sequential-sibling
    /// gating (§4.7 step 4) and plan-view bookkeeping (§4.10).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_scripts: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_scripts: Vec<PlanScript>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanScript {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptData {
    pub script_id: ScriptId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub script_type: String,
    pub framework: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub timeout: u64,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: String,
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_preserving_field_names() {
        let payload = TaskPayload {
            task_id: TaskId::new_v4(),
            execution_id: ExecutionId::new_v4(),
            browser_type: "chromium".to_string(),
            timeout: 120,
            variables: HashMap::new(),
            script_data: ScriptData {
                script_id: ScriptId::new_v4(),
                name: "login flow".to_string(),
                description: String::new(),
                script_type: "ui".to_string(),
                framework: "playwright".to_string(),
                steps: vec![Step {
                    step_type: "click".to_string(),
                    name: "submit".to_string(),
                    params: HashMap::new(),
                }],
                variables: HashMap::new(),
                timeout: 120,
                project_id: None,
            },
            parent_execution_id: None,
            mode: None,
            script_index: None,
            total_scripts: None,
            plan_scripts: vec![],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["browser_type"], "chromium");
        assert_eq!(json["script_data"]["script_id"], payload.script_data.script_id.to_string());

        let back: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_id, payload.task_id);
    }
}
