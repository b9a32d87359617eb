//! Row types for the task record store (C1). Each carries a hand-written
//! `FromRow` for `sqlx::Any` — `Any` only decodes bools, integers, floats,
//! `String` and `Vec<u8>` (no `Uuid`, no `chrono` types), so ids are stored
//! as their canonical text form and timestamps as RFC3339 strings. Enums are
//! persisted the same way, as their `Display` text parsed back with
//! `FromStr`, and JSON-shaped columns go through `serde_json::Value` — one
//! text-everywhere schema works unmodified against Postgres and SQLite
//! (§10.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::any::AnyRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;
use taskmesh_common::ids::{ExecutionId, PlanId, ProjectId, ScriptId, TaskId, WorkerId};
use taskmesh_common::model::{
    ExecutionKind, ExecutionMode, ExecutionState, Priority, TaskState, WorkerScope, WorkerState,
};

fn parse_col<T: FromStr>(row: &AnyRow, col: &str) -> Result<T, sqlx::Error>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(col)?;
    raw.parse::<T>()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: col.to_string(),
            source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        })
}

fn parse_opt_col<T: FromStr>(row: &AnyRow, col: &str) -> Result<Option<T>, sqlx::Error>
where
    T::Err: std::fmt::Display,
{
    row.try_get::<Option<String>, _>(col)?
        .map(|raw| {
            raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
                index: col.to_string(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            })
        })
        .transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub display_id: String,
    pub kind: ExecutionKind,
    pub mode: Option<ExecutionMode>,
    pub parent: Option<ExecutionId>,
    pub plan_ref: Option<PlanId>,
    pub script_ref: Option<ScriptId>,
    pub state: ExecutionState,
    pub result: Option<Json>,
    pub variables_snapshot: Json,
    pub breakpoints: Json,
    pub current_step: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, AnyRow> for Execution {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_col(row, "id")?,
            display_id: row.try_get("display_id")?,
            kind: parse_col(row, "kind")?,
            mode: parse_opt_col(row, "mode")?,
            parent: parse_opt_col(row, "parent")?,
            plan_ref: parse_opt_col(row, "plan_ref")?,
            script_ref: parse_opt_col(row, "script_ref")?,
            state: parse_col(row, "state")?,
            result: row
                .try_get::<Option<String>, _>("result")?
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: "result".to_string(),
                    source: Box::new(e),
                })?,
            variables_snapshot: serde_json::from_str(&row.try_get::<String, _>("variables_snapshot")?)
                .unwrap_or(Json::Null),
            breakpoints: serde_json::from_str(&row.try_get::<String, _>("breakpoints")?)
                .unwrap_or(Json::Array(vec![])),
            current_step: row.try_get("current_step")?,
            started_at: parse_opt_col(row, "started_at")?,
            completed_at: parse_opt_col(row, "completed_at")?,
            owner: row.try_get("owner")?,
            created_at: parse_col(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub execution_ref: ExecutionId,
    pub worker_ref: Option<WorkerId>,
    pub state: TaskState,
    pub priority: Priority,
    pub payload: Json,
    pub error: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, AnyRow> for Task {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_col(row, "id")?,
            execution_ref: parse_col(row, "execution_ref")?,
            worker_ref: parse_opt_col(row, "worker_ref")?,
            state: parse_col(row, "state")?,
            priority: parse_col(row, "priority")?,
            payload: serde_json::from_str(&row.try_get::<String, _>("payload")?).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "payload".to_string(),
                    source: Box::new(e),
                }
            })?,
            error: row.try_get("error")?,
            assigned_at: parse_opt_col(row, "assigned_at")?,
            started_at: parse_opt_col(row, "started_at")?,
            completed_at: parse_opt_col(row, "completed_at")?,
            created_at: parse_col(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub owner: String,
    pub state: WorkerState,
    pub scope: WorkerScope,
    pub bound_projects: Vec<ProjectId>,
    pub max_concurrent: i32,
    pub current_tasks: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub browser_types: Vec<String>,
    pub platform: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// §3: online iff the heartbeat is fresh and the worker hasn't been disabled.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self
                .last_heartbeat
                .is_some_and(|hb| (now - hb).num_seconds() < 120)
    }

    /// §3: available adds state eligibility on top of online-ness.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && matches!(self.state, WorkerState::Idle | WorkerState::Online | WorkerState::Busy)
            && self
                .last_heartbeat
                .is_some_and(|hb| (now - hb).num_seconds() < 120)
    }
}

impl<'r> FromRow<'r, AnyRow> for Worker {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        let bound_projects: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("bound_projects")?).unwrap_or_default();
        let browser_types: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("browser_types")?).unwrap_or_default();

        let bound_projects = bound_projects
            .into_iter()
            .map(|s| s.parse::<ProjectId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "bound_projects".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: parse_col(row, "id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            state: parse_col(row, "state")?,
            scope: parse_col(row, "scope")?,
            bound_projects,
            max_concurrent: row.try_get("max_concurrent")?,
            current_tasks: row.try_get("current_tasks")?,
            last_heartbeat: parse_opt_col(row, "last_heartbeat")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            browser_types,
            platform: row.try_get("platform")?,
            created_at: parse_col(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: i64,
    pub scope: VariableScope,
    pub scope_ref: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Project,
    Script,
}

impl std::fmt::Display for VariableScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VariableScope::Project => "project",
            VariableScope::Script => "script",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VariableScope {
    type Err = taskmesh_common::model::UnknownVariant;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(VariableScope::Project),
            "script" => Ok(VariableScope::Script),
            other => Err(taskmesh_common::model::UnknownVariant(other.to_string())),
        }
    }
}

impl<'r> FromRow<'r, AnyRow> for Variable {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            scope: parse_col(row, "scope")?,
            scope_ref: row.try_get("scope_ref")?,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: i64,
    pub worker_ref: WorkerId,
    pub state: WorkerState,
    pub current_tasks: i32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, AnyRow> for StatusLogEntry {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            worker_ref: parse_col(row, "worker_ref")?,
            state: parse_col(row, "state")?,
            current_tasks: row.try_get("current_tasks")?,
            cpu_usage: row.try_get("cpu_usage")?,
            memory_usage: row.try_get("memory_usage")?,
            disk_usage: row.try_get("disk_usage")?,
            message: row.try_get("message")?,
            created_at: parse_col(row, "created_at")?,
        })
    }
}
