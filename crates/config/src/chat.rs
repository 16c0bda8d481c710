//! Tool-loop and prompt configuration settings.

use std::time::Duration;

use serde::Deserialize;

/// Tool-choice policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// The model must call at least one tool.
    Required,
    /// Tools are disabled for the call.
    None,
}

/// Tool-loop and prompt configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Maximum tool-calling iterations per request.
    pub max_tool_iterations: u32,
    /// Wall-clock budget for the tool loop in seconds. Zero disables it.
    pub tool_loop_timeout: u64,
    /// Tool choice sent on the first iteration.
    pub first_iteration_tool_choice: ToolChoiceMode,
    /// Maximum characters of a single tool result before truncation.
    pub max_tool_result_chars: usize,
    /// Path of the system prompt file.
    pub system_prompt_path: String,
    /// Prompt used when the file is absent or unreadable.
    pub system_prompt_default: String,
    /// Temperature applied when the request does not specify one.
    pub default_temperature: f32,
}

impl ChatConfig {
    /// Wall-clock budget, or `None` when disabled.
    pub fn tool_loop_timeout(&self) -> Option<Duration> {
        (self.tool_loop_timeout > 0).then(|| Duration::from_secs(self.tool_loop_timeout))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            tool_loop_timeout: 120,
            first_iteration_tool_choice: ToolChoiceMode::Auto,
            max_tool_result_chars: 20_000,
            system_prompt_path: "system_prompt.txt".to_string(),
            system_prompt_default: "You are a helpful assistant with access to tools.".to_string(),
            default_temperature: 0.7,
        }
    }
}
