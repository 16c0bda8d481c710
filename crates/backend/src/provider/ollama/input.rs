use serde::Serialize;
use serde_json::Value;

use crate::messages::{ChatMessage, Role};
use crate::provider::{ChatParams, ProjectedTool};

/// Outgoing `/api/chat` payload.
#[derive(Debug, Serialize)]
pub(crate) struct OllamaChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<OllamaMessage<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ProjectedTool]>,
    /// Always emitted, `"none"` included, even with no tools offered.
    pub tool_choice: &'static str,
    pub options: OllamaOptions,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaOptions {
    pub temperature: f32,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OllamaToolCallOut<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaToolCallOut<'a> {
    pub function: OllamaFunctionOut<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaFunctionOut<'a> {
    pub name: &'a str,
    pub arguments: &'a Value,
}

impl<'a> OllamaChatRequest<'a> {
    pub(crate) fn build(
        model: &'a str,
        params: &ChatParams<'a>,
        tools: Option<&'a [ProjectedTool]>,
        stream: bool,
    ) -> Self {
        Self {
            model,
            messages: params.messages.iter().map(OllamaMessage::from).collect(),
            stream,
            tools,
            tool_choice: params.tool_choice.as_str(),
            options: OllamaOptions {
                temperature: params.temperature,
            },
        }
    }
}

impl<'a> From<&'a ChatMessage> for OllamaMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        // The native dialect has no call ids; assistant calls are sent as
        // bare function name/argument pairs and tool results rely on
        // message order for correlation.
        let tool_calls = message
            .tool_calls
            .iter()
            .map(|call| OllamaToolCallOut {
                function: OllamaFunctionOut {
                    name: &call.name,
                    arguments: &call.arguments,
                },
            })
            .collect();

        Self {
            role,
            content: &message.content,
            tool_calls,
        }
    }
}
