//! Engine error taxonomy.
//!
//! Task-level failures never surface as errors; they are recorded on the
//! task's execution record and drive status transitions. `EngineError`
//! covers the failures that do escape: rejected configuration, plugin
//! registration problems, run-level execution faults, and storage failures.

use pipevine_state::StateError;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration was rejected by the validator.
    #[error("validation failed for '{source_label}':\n  - {}", errors.join("\n  - "))]
    Validation {
        source_label: String,
        errors: Vec<String>,
    },

    /// A plugin could not be registered or resolved.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A run-level execution fault (deadlocked graph, executor bug).
    #[error("execution error: {0}")]
    Execution(String),

    /// The state store failed after its retry.
    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    /// Validation failure for `source_label` carrying every collected error.
    #[must_use]
    pub fn validation(source_label: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Validation {
            source_label: source_label.into(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_error() {
        let err = EngineError::validation(
            "pipeline.yml",
            vec!["name is required".into(), "cycle detected".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("pipeline.yml"));
        assert!(msg.contains("name is required"));
        assert!(msg.contains("cycle detected"));
    }

    #[test]
    fn state_error_converts() {
        let inner = StateError::LockPoisoned;
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::State(_)));
    }
}
