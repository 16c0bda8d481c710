use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use serde_json::Value;

use crate::{Tool, ToolDescriptor};

/// Name-indexed set of tools, built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    descriptors: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, deriving its descriptor. Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.name().to_string();

        if self.tools.contains_key(&name) {
            bail!("tool '{name}' is already registered");
        }

        self.descriptors.push(ToolDescriptor {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
        });
        self.tools.insert(name, tool);

        Ok(())
    }

    /// Descriptors of every registered tool, in registration order.
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke a tool by name, converting every failure mode into a
    /// result string. Oversized output is truncated per result, with an
    /// explicit notice appended.
    pub async fn dispatch(&self, name: &str, arguments: Value, max_result_chars: usize) -> String {
        let Some(tool) = self.tools.get(name) else {
            log::warn!("Model requested unregistered tool '{name}'");
            return format!("Error: tool {name} not registered");
        };

        let output = match tool.invoke(arguments).await {
            Ok(output) => output,
            Err(err) => {
                log::warn!("Tool '{name}' failed: {err}");
                return format!("Error: {err}");
            }
        };

        truncate_result(output, max_result_chars)
    }
}

fn truncate_result(output: String, max_chars: usize) -> String {
    if max_chars == 0 || output.chars().count() <= max_chars {
        return output;
    }

    let kept: String = output.chars().take(max_chars).collect();
    let dropped = output.chars().count() - max_chars;

    format!("{kept}\n[tool output truncated: {dropped} characters removed]")
}
