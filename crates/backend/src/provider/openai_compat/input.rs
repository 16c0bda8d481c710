use serde::Serialize;
use serde_json::Value;

use crate::messages::{ChatMessage, Role, ToolCallRequest};
use crate::provider::{ChatParams, ProjectedTool};

/// Outgoing `/v1/chat/completions` payload.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<OpenAiMessage<'a>>,
    pub temperature: f32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ProjectedTool]>,
    /// Always emitted, `"none"` included, even with no tools offered.
    pub tool_choice: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OpenAiToolCallOut<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiToolCallOut<'a> {
    pub id: &'a str,
    pub r#type: &'static str,
    pub function: OpenAiFunctionOut<'a>,
}

/// OpenAI carries arguments as a JSON string, not an object.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionOut<'a> {
    pub name: &'a str,
    pub arguments: String,
}

impl<'a> OpenAiChatRequest<'a> {
    pub(crate) fn build(
        model: &'a str,
        params: &ChatParams<'a>,
        tools: Option<&'a [ProjectedTool]>,
        stream: bool,
    ) -> Self {
        Self {
            model,
            messages: params.messages.iter().map(OpenAiMessage::from).collect(),
            temperature: params.temperature,
            stream,
            tools,
            tool_choice: params.tool_choice.as_str(),
        }
    }
}

impl<'a> From<&'a ChatMessage> for OpenAiMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        Self {
            role,
            content: &message.content,
            tool_calls: message.tool_calls.iter().map(OpenAiToolCallOut::from).collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

impl<'a> From<&'a ToolCallRequest> for OpenAiToolCallOut<'a> {
    fn from(call: &'a ToolCallRequest) -> Self {
        let arguments = match &call.arguments {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };

        Self {
            id: &call.id,
            r#type: "function",
            function: OpenAiFunctionOut {
                name: &call.name,
                arguments,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ToolChoice;

    #[test]
    fn round_trips_tool_history_in_openai_shape() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCallRequest {
            id: "call_1".to_string(),
            name: "echo".to_string(),
            arguments: serde_json::json!({"text": "ping"}),
        });

        let messages = vec![
            ChatMessage::user("run echo"),
            assistant,
            ChatMessage::tool("call_1", "ping"),
        ];
        let params = ChatParams {
            messages: &messages,
            tools: &[],
            temperature: 0.0,
            tool_choice: ToolChoice::Auto,
            model_override: None,
        };

        let request = OpenAiChatRequest::build("gpt-test", &params, None, false);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            value["messages"][1]["tool_calls"][0]["function"]["arguments"],
            "{\"text\":\"ping\"}"
        );
        assert_eq!(value["messages"][2]["tool_call_id"], "call_1");
    }
}
