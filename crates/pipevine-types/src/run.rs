//! Run records produced by the executor.
//!
//! A [`PipelineRun`] is created per execution and owns one
//! [`TaskExecution`] per task. Timestamps are `DateTime<Utc>`; storage
//! backends persist them as ISO-8601 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{Task, Trigger};

/// Status of a single task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// True once the task can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// True if a dependent task may start on top of this one.
    #[must_use]
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Terminal (or in-flight) status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
    PartialSuccess,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::PartialSuccess => "partial_success",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "partial_success" => Ok(Self::PartialSuccess),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Outcome of one plugin invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PluginResult {
    /// A successful result carrying `output`.
    #[must_use]
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metadata: None,
        }
    }

    /// A failed result carrying an error message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: None,
        }
    }
}

/// Mutable record of one task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PluginResult>,
}

impl TaskExecution {
    /// Fresh pending record for `task`.
    #[must_use]
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            result: None,
        }
    }
}

/// Mutable record of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskExecution>,
    /// The trigger that actually initiated this run.
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    /// New in-flight run with one pending execution per task.
    #[must_use]
    pub fn new(id: impl Into<String>, pipeline_name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: id.into(),
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            tasks: Vec::new(),
            trigger,
            error: None,
        }
    }

    /// Look up a task execution by task id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Mutable lookup of a task execution by task id.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }
}
