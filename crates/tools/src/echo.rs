use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// Text to echo back unchanged.
    text: String,
}

/// Returns its input unchanged. Used by tests and as a wiring smoke test.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged."
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(EchoArgs)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, arguments: Value) -> anyhow::Result<String> {
        let args: EchoArgs = serde_json::from_value(arguments)?;
        Ok(args.text)
    }
}
