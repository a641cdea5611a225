//! Pipeline declaration types.
//!
//! A [`Pipeline`] is immutable once the validator has produced it. The
//! structures here serialize to the internal snapshot format (used by the
//! scheduler catalogue); [`Pipeline::to_config_value`] renders the external
//! configuration-document shape back out, so a validated pipeline
//! round-trips through the parser.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default concurrency applied when the declaration omits one.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default retry delay in milliseconds when a retry block omits `delay`.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// A validated, immutable pipeline declaration.
///
/// `tasks` preserves declaration order, which is NOT the execution order;
/// the executor derives that from `depends_on` edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pipeline-wide timeout in milliseconds; 0 means unbounded.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Pipeline {
    /// Look up a task by id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Render the external configuration-document shape (`{"pipeline": ...}`).
    ///
    /// Feeding the result back through the validator yields an equal
    /// `Pipeline`.
    #[must_use]
    pub fn to_config_value(&self) -> Value {
        let tasks: Vec<Value> = self.tasks.iter().map(Task::to_config_value).collect();
        let triggers: Vec<Value> = self.triggers.iter().map(Trigger::to_config_value).collect();

        let mut pipeline = serde_json::Map::new();
        pipeline.insert("name".into(), json!(self.name));
        pipeline.insert("version".into(), json!(self.version));
        if let Some(ref description) = self.description {
            pipeline.insert("description".into(), json!(description));
        }
        pipeline.insert("tasks".into(), Value::Array(tasks));
        if !self.triggers.is_empty() {
            pipeline.insert("triggers".into(), Value::Array(triggers));
        }
        pipeline.insert("concurrency".into(), json!(self.concurrency));
        pipeline.insert("timeout".into(), json!(self.timeout_ms));
        if !self.env.is_empty() {
            pipeline.insert("env".into(), json!(self.env));
        }
        json!({ "pipeline": Value::Object(pipeline) })
    }
}

/// A single unit of work within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Display name; falls back to `id` during validation.
    pub name: String,
    /// Name of the plugin capability that executes this task.
    pub plugin: String,
    /// Opaque configuration passed verbatim to the plugin.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-task timeout in milliseconds; `None` falls back to the executor
    /// default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    fn to_config_value(&self) -> Value {
        let mut task = serde_json::Map::new();
        task.insert("id".into(), json!(self.id));
        task.insert("name".into(), json!(self.name));
        task.insert("plugin".into(), json!(self.plugin));
        task.insert("config".into(), self.config.clone());
        if !self.depends_on.is_empty() {
            task.insert("dependsOn".into(), json!(self.depends_on));
        }
        if let Some(ref retry) = self.retry {
            task.insert(
                "retry".into(),
                json!({ "attempts": retry.attempts, "delay": retry.delay_ms }),
            );
        }
        if let Some(timeout) = self.timeout_ms {
            task.insert("timeout".into(), json!(timeout));
        }
        if !self.enabled {
            task.insert("enabled".into(), json!(false));
        }
        Value::Object(task)
    }
}

/// Retry policy for a task. `attempts` is the total number of tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

/// Event type that initiates a run.
///
/// The parser accepts all three variants; the scheduler only arms `Cron`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Webhook {
        path: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Manual,
}

impl Trigger {
    /// Wire-format tag for storage and display.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Webhook { .. } => "webhook",
            Self::Manual => "manual",
        }
    }

    fn to_config_value(&self) -> Value {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => {
                let mut config = serde_json::Map::new();
                config.insert("expression".into(), json!(expression));
                if let Some(tz) = timezone {
                    config.insert("timezone".into(), json!(tz));
                }
                json!({ "type": "cron", "config": Value::Object(config) })
            }
            Self::Webhook {
                path,
                method,
                secret,
            } => {
                let mut config = serde_json::Map::new();
                config.insert("path".into(), json!(path));
                config.insert("method".into(), json!(method));
                if let Some(secret) = secret {
                    config.insert("secret".into(), json!(secret));
                }
                json!({ "type": "webhook", "config": Value::Object(config) })
            }
            Self::Manual => json!({ "type": "manual", "config": {} }),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}
