//! `delay`: sleeps for `ms` milliseconds, cooperatively cancellable.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pipevine_types::PluginResult;

use crate::plugin::{ExecutionContext, Plugin, PluginCheck};

pub struct DelayPlugin;

#[async_trait]
impl Plugin for DelayPlugin {
    fn name(&self) -> &str {
        "delay"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> PluginResult {
        let ms = config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => {
                PluginResult::ok(json!({ "slept_ms": ms }))
            }
            () = ctx.cancel.cancelled() => {
                PluginResult::fail("delay cancelled before completion")
            }
        }
    }

    fn validate(&self, config: &Value) -> PluginCheck {
        match config.get("ms") {
            None => PluginCheck::ok(),
            Some(value) if value.as_u64().is_some() => PluginCheck::ok(),
            Some(value) => PluginCheck::invalid(vec![format!(
                "'ms' must be a non-negative integer, got {value}"
            )]),
        }
    }
}
