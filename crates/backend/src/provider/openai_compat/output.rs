use serde::Deserialize;
use serde_json::Value;

use crate::error::{BackendError, BackendResult};
use crate::messages::{
    ChatMessage, ChatOutcome, FinishReason, Role, StreamFrame, ToolCallFragment, ToolCallRequest, parse_arguments,
    synthesize_call_id,
};

/// Non-streaming `/v1/chat/completions` response.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatResponse {
    pub choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChoice {
    pub message: OpenAiResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl OpenAiChatResponse {
    pub(crate) fn into_outcome(self) -> BackendResult<ChatOutcome> {
        let Some(choice) = self.choices.into_iter().next() else {
            return Err(BackendError::Protocol("response carries no choices".to_string()));
        };

        let tool_calls: Vec<ToolCallRequest> = choice.message.tool_calls.into_iter().map(normalize_call).collect();

        let finish_reason = if tool_calls.is_empty() {
            choice.finish_reason.as_deref().map(FinishReason::parse)
        } else {
            Some(FinishReason::ToolCalls)
        };

        Ok(ChatOutcome {
            message: ChatMessage {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                tool_call_id: None,
            },
            finish_reason,
        })
    }
}

fn normalize_call(call: OpenAiToolCall) -> ToolCallRequest {
    // Arguments are a JSON string on the wire; some servers send objects.
    let arguments = match call.function.arguments {
        Value::String(raw) => parse_arguments(&raw),
        other => other,
    };

    ToolCallRequest {
        id: call.id.unwrap_or_else(synthesize_call_id),
        name: call.function.name,
        arguments,
    }
}

/// One SSE data frame of a streaming response.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiStreamChunk {
    #[serde(default)]
    pub choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiStreamChoice {
    #[serde(default)]
    pub delta: OpenAiDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OpenAiDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAiToolCallDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl OpenAiStreamChunk {
    pub(crate) fn into_frame(self) -> StreamFrame {
        let Some(choice) = self.choices.into_iter().next() else {
            return StreamFrame::default();
        };

        let tool_calls = choice
            .delta
            .tool_calls
            .into_iter()
            .map(|delta| {
                let (name, arguments) = delta
                    .function
                    .map(|f| (f.name, f.arguments.unwrap_or_default()))
                    .unwrap_or((None, String::new()));

                ToolCallFragment {
                    index: delta.index,
                    id: delta.id,
                    name,
                    arguments,
                }
            })
            .collect();

        StreamFrame {
            content: choice.delta.content,
            tool_calls,
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
        }
    }
}
