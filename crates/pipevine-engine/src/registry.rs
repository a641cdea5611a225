//! Plugin registry: name → execute capability.
//!
//! Populated at startup and read-only during execution. Registration
//! rejects capabilities with an empty name or version; bulk registration
//! logs rejected entries and continues so one bad plugin never blocks the
//! rest.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::EngineError;
use crate::plugin::{Plugin, PluginCheck};
use crate::plugins;

/// Mapping from plugin name to capability.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the compiled-in plugin set.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_all(plugins::builtins());
        registry
    }

    /// Register a capability under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Plugin`] when the plugin reports an empty
    /// name or version.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        if plugin.name().trim().is_empty() {
            return Err(EngineError::Plugin(
                "plugin registration rejected: empty name".to_string(),
            ));
        }
        if plugin.version().trim().is_empty() {
            return Err(EngineError::Plugin(format!(
                "plugin '{}' registration rejected: empty version",
                plugin.name()
            )));
        }
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!(plugin = name, "replaced previously registered plugin");
        }
        Ok(())
    }

    /// Register many capabilities; a rejected one is logged and skipped.
    pub fn register_all(&mut self, plugins: Vec<Arc<dyn Plugin>>) {
        for plugin in plugins {
            if let Err(e) = self.register(plugin) {
                tracing::warn!("skipping plugin: {e}");
            }
        }
    }

    /// Resolve the capability registered under `name`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Delegate a config pre-flight check to the named plugin.
    ///
    /// Unknown names fail the check rather than erroring, so the validator
    /// can report them alongside other diagnostics.
    #[must_use]
    pub fn validate(&self, name: &str, config: &Value) -> PluginCheck {
        match self.plugins.get(name) {
            Some(plugin) => plugin.validate(config),
            None => PluginCheck::invalid(vec![format!("unknown plugin '{name}'")]),
        }
    }

    /// Registered plugin names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
