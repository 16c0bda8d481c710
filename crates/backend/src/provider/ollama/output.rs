use serde::Deserialize;
use serde_json::Value;

use crate::messages::{
    ChatMessage, ChatOutcome, FinishReason, Role, StreamFrame, ToolCallFragment, ToolCallRequest, parse_arguments,
    synthesize_call_id,
};

/// One `/api/chat` response object; the same shape is used for the
/// non-streaming body and for each streamed line.
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaChatResponse {
    #[serde(default)]
    pub message: OllamaResponseMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OllamaResponseMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OllamaToolCall {
    pub function: OllamaFunctionCall,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OllamaFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl OllamaChatResponse {
    /// Normalise a non-streaming response; the dialect assigns no call
    /// ids, so stable ones are synthesised here.
    pub(crate) fn into_outcome(self) -> ChatOutcome {
        let tool_calls: Vec<ToolCallRequest> = self.message.tool_calls.into_iter().map(normalize_call).collect();

        let finish_reason = if tool_calls.is_empty() {
            self.done_reason.as_deref().map(FinishReason::parse)
        } else {
            Some(FinishReason::ToolCalls)
        };

        ChatOutcome {
            message: ChatMessage {
                role: Role::Assistant,
                content: self.message.content,
                tool_calls,
                tool_call_id: None,
            },
            finish_reason,
        }
    }

    /// Convert a streamed line into a delta frame. Native tool calls
    /// arrive complete; `next_call_index` keeps fragment indices unique
    /// across frames.
    pub(crate) fn into_frame(self, next_call_index: &mut usize) -> StreamFrame {
        let tool_calls = self
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let index = *next_call_index;
                *next_call_index += 1;

                ToolCallFragment {
                    index,
                    id: Some(synthesize_call_id()),
                    name: Some(call.function.name),
                    arguments: call.function.arguments.to_string(),
                }
            })
            .collect();

        let finish_reason = self
            .done
            .then(|| FinishReason::parse(self.done_reason.as_deref().unwrap_or("stop")));

        StreamFrame {
            content: (!self.message.content.is_empty()).then_some(self.message.content),
            tool_calls,
            finish_reason,
        }
    }
}

fn normalize_call(call: OllamaToolCall) -> ToolCallRequest {
    // Some models emit arguments as a JSON string rather than an object.
    let arguments = match call.function.arguments {
        Value::String(raw) => parse_arguments(&raw),
        other => other,
    };

    ToolCallRequest {
        id: synthesize_call_id(),
        name: call.function.name,
        arguments,
    }
}
