//! The `search_docs` tool exposed to the model.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tools::Tool;

use crate::index::DocsIndex;
use crate::types::SearchResult;

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    /// What to look for in the indexed documentation.
    query: String,
}

/// Hybrid documentation search over the local index.
pub struct DocsSearchTool {
    index: Arc<DocsIndex>,
}

impl DocsSearchTool {
    /// Wrap an index as a registrable tool.
    pub fn new(index: Arc<DocsIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for DocsSearchTool {
    fn name(&self) -> &str {
        "search_docs"
    }

    fn description(&self) -> &str {
        "Search the indexed documentation. Returns the most relevant sections with their source URLs."
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(SearchArgs))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, arguments: Value) -> anyhow::Result<String> {
        let args: SearchArgs = serde_json::from_value(arguments)?;

        let results = self.index.search(&args.query).await?;

        Ok(format_results(&results))
    }
}

pub(crate) fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No matching documentation found.".to_string();
    }

    results
        .iter()
        .enumerate()
        .map(|(position, result)| {
            let heading = if result.heading_path.is_empty() {
                String::new()
            } else {
                format!(" — {}", result.heading_path.join(" > "))
            };

            format!(
                "[{}] {}{heading} (score {:.2})\n{}",
                position + 1,
                result.url,
                result.score,
                result.parent_text.trim(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
