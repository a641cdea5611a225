//! The plugin capability contract and the per-task execution context.
//!
//! A plugin is a value implementing [`Plugin`]: a name, a version, an
//! `execute` capability, and an optional config pre-flight check. The
//! executor hands every invocation an [`ExecutionContext`] scoped to one
//! task within one run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pipevine_state::StateStore;
use pipevine_types::{Pipeline, PluginResult, Task};

/// Outcome of a plugin's config pre-flight check.
#[derive(Debug, Clone)]
pub struct PluginCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl PluginCheck {
    /// A passing check.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing check carrying the collected errors.
    #[must_use]
    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// An execute capability registered under a name.
///
/// `execute` never errors at the type level: failures are expressed through
/// [`PluginResult::fail`] so the executor can apply retry policy uniformly.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry name; must be non-empty.
    fn name(&self) -> &str;

    /// Plugin version; must be non-empty.
    fn version(&self) -> &str;

    /// Run the task. `config` is the task's opaque configuration, passed
    /// verbatim from the declaration.
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> PluginResult;

    /// Optional config pre-flight; defaults to valid.
    fn validate(&self, _config: &Value) -> PluginCheck {
        PluginCheck::ok()
    }
}

/// Everything the executor exposes to a plugin for one task invocation.
///
/// Contexts are per-task and never shared between tasks.
pub struct ExecutionContext {
    /// Read snapshot of the pipeline declaration.
    pub pipeline: Arc<Pipeline>,
    /// Read snapshot of the task being executed.
    pub task: Task,
    /// Id of the enclosing run.
    pub execution_id: String,
    /// Handle to the state store.
    pub state: Arc<dyn StateStore>,
    /// Results of tasks that already reached `success`, keyed by task id.
    pub previous_results: HashMap<String, PluginResult>,
    /// Pipeline env variables.
    pub variables: HashMap<String, String>,
    /// Cancelled when the task's deadline expires; long-running plugins
    /// should poll or select on it.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Logger scoped to this run and task.
    #[must_use]
    pub fn logger(&self) -> TaskLogger<'_> {
        TaskLogger {
            execution_id: &self.execution_id,
            task_id: &self.task.id,
        }
    }
}

/// Four-level logger carrying run and task identity on every line.
pub struct TaskLogger<'a> {
    execution_id: &'a str,
    task_id: &'a str,
}

impl TaskLogger<'_> {
    pub fn debug(&self, message: &str) {
        tracing::debug!(execution_id = self.execution_id, task = self.task_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(execution_id = self.execution_id, task = self.task_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(execution_id = self.execution_id, task = self.task_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(execution_id = self.execution_id, task = self.task_id, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_check_constructors() {
        assert!(PluginCheck::ok().valid);
        let check = PluginCheck::invalid(vec!["missing field".into()]);
        assert!(!check.valid);
        assert_eq!(check.errors.len(), 1);
    }
}
