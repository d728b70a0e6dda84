use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    OneOff,
    Recurring,
    Research,
    Comparison,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    Human,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
    NoAction,
}

/// Result of a single `TaskHandler::run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub message: String,
    #[serde(default)]
    pub created_tasks: Vec<String>,
}

impl TaskResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            message: message.into(),
            created_tasks: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            message: message.into(),
            created_tasks: Vec::new(),
        }
    }

    pub fn no_action(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::NoAction,
            message: message.into(),
            created_tasks: Vec::new(),
        }
    }
}

/// A scheduled work item. Invariant: exactly one of `cron_expression` or
/// `run_at` is set for recurring/one-off tasks; `research` tasks may omit
/// both. One-off and research tasks self-disable after firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    pub handler: String,
    #[serde(default)]
    pub params: Value,
    pub enabled: bool,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<TaskStatus>,
    #[serde(default)]
    pub run_count: u64,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        task_type: TaskType,
        handler: impl Into<String>,
        params: Value,
        created_by: CreatedBy,
    ) -> Self {
        Self {
            id: format!("task_{}", Uuid::new_v4().simple()),
            name: name.into(),
            task_type,
            cron_expression: None,
            run_at: None,
            handler: handler.into(),
            params,
            enabled: true,
            created_by,
            created_at: Utc::now(),
            parent_task_id: None,
            last_run_at: None,
            last_result: None,
            run_count: 0,
        }
    }
}
