//! `echo`: returns its configuration as output.

use async_trait::async_trait;
use serde_json::Value;

use pipevine_types::PluginResult;

use crate::plugin::{ExecutionContext, Plugin};

pub struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> PluginResult {
        ctx.logger().debug("echoing task config");
        PluginResult::ok(config.clone())
    }
}
