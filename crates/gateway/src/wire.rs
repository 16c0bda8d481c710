//! OpenAI-compatible wire shapes and request validation.

use backend::{ChatMessage, Role, ToolCallRequest, ToolChoice};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// A validated chat request, normalised to adapter types.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Per-request model override; `None` means the configured default.
    pub model: Option<String>,
    /// Conversation history, already converted.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature, when the caller set one.
    pub temperature: Option<f32>,
    /// Whether the caller wants SSE chunks.
    pub stream: bool,
    /// Tool-choice override for the first iteration.
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Deserialize)]
struct IncomingRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tool_choice: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<IncomingToolCall>>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingToolCall {
    id: String,
    function: IncomingFunction,
}

#[derive(Debug, Deserialize)]
struct IncomingFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Parse and validate a request body.
pub fn parse_request(body: &[u8]) -> Result<ChatRequest, GatewayError> {
    let raw: Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(format!("Malformed JSON body: {e}")))?;

    // Explicit shape checks before typed deserialization so the caller
    // gets a precise message.
    match raw.get("messages") {
        None => return Err(GatewayError::BadRequest("'messages' is required".to_string())),
        Some(Value::Array(messages)) if messages.is_empty() => {
            return Err(GatewayError::BadRequest("'messages' must not be empty".to_string()));
        }
        Some(Value::Array(_)) => {}
        Some(_) => return Err(GatewayError::BadRequest("'messages' must be a list".to_string())),
    }

    let incoming: IncomingRequest =
        serde_json::from_value(raw).map_err(|e| GatewayError::BadRequest(format!("Invalid request shape: {e}")))?;

    if let Some(temperature) = incoming.temperature
        && temperature < 0.0
    {
        return Err(GatewayError::BadRequest(format!(
            "'temperature' must be >= 0, got {temperature}"
        )));
    }

    let tool_choice = match incoming.tool_choice.as_deref() {
        None => None,
        Some("auto") => Some(ToolChoice::Auto),
        Some("required") => Some(ToolChoice::Required),
        Some("none") => Some(ToolChoice::None),
        Some(other) => {
            return Err(GatewayError::BadRequest(format!(
                "'tool_choice' must be one of auto/required/none, got '{other}'"
            )));
        }
    };

    let messages: Vec<ChatMessage> = incoming
        .messages
        .into_iter()
        .map(convert_message)
        .collect::<Result<_, _>>()?;

    match messages.first().map(|m| m.role) {
        Some(Role::User | Role::System) => {}
        _ => {
            return Err(GatewayError::BadRequest(
                "the first message must have role 'user' or 'system'".to_string(),
            ));
        }
    }

    Ok(ChatRequest {
        model: incoming.model.filter(|m| !m.is_empty()),
        messages,
        temperature: incoming.temperature,
        stream: incoming.stream.unwrap_or(false),
        tool_choice,
    })
}

fn convert_message(incoming: IncomingMessage) -> Result<ChatMessage, GatewayError> {
    let role = match incoming.role.as_str() {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => {
            return Err(GatewayError::BadRequest(format!("unknown message role '{other}'")));
        }
    };

    let tool_calls = incoming
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: match call.function.arguments {
                Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                other => other,
            },
        })
        .collect();

    Ok(ChatMessage {
        role,
        content: incoming.content.unwrap_or_default(),
        tool_calls,
        tool_call_id: incoming.tool_call_id,
    })
}

/// Non-streaming completion body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    /// Completion id, `chatcmpl-` prefixed.
    pub id: String,
    /// Always `chat.completion`.
    pub object: &'static str,
    /// Unix seconds.
    pub created: u64,
    /// Model the caller sees (override or default).
    pub model: String,
    /// Exactly one choice.
    pub choices: Vec<Choice>,
    /// Token accounting; the gateway does not meter, so zeros.
    pub usage: Usage,
}

/// One response choice.
#[derive(Debug, Serialize)]
pub struct Choice {
    /// Always zero.
    pub index: u32,
    /// The final assistant message.
    pub message: ResponseMessage,
    /// Always `stop`; tool traffic never leaves the gateway.
    pub finish_reason: &'static str,
}

/// Assistant message in a completion.
#[derive(Debug, Serialize)]
pub struct ResponseMessage {
    /// Always `assistant`.
    pub role: &'static str,
    /// Final text.
    pub content: String,
}

/// Token usage block.
#[derive(Debug, Default, Serialize)]
pub struct Usage {
    /// Not metered.
    pub prompt_tokens: u32,
    /// Not metered.
    pub completion_tokens: u32,
    /// Not metered.
    pub total_tokens: u32,
}

impl ChatCompletionResponse {
    /// Wrap final text in the OpenAI completion shape.
    pub fn new(model: String, content: String) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion",
            created: unix_now(),
            model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
            usage: Usage::default(),
        }
    }
}

/// Streaming chunk body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    /// Shared across all chunks of one response.
    pub id: String,
    /// Always `chat.completion.chunk`.
    pub object: &'static str,
    /// Unix seconds.
    pub created: u64,
    /// Model the caller sees.
    pub model: String,
    /// Exactly one delta choice.
    pub choices: Vec<ChunkChoice>,
}

/// One streamed choice delta.
#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    /// Always zero.
    pub index: u32,
    /// Incremental content.
    pub delta: Delta,
    /// `stop` on the terminal chunk, absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

/// Delta payload.
#[derive(Debug, Default, Serialize)]
pub struct Delta {
    /// `assistant` on the opening chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    /// Content to append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Per-response chunk factory: one shared id and timestamp across the
/// role opener, every content delta, and the terminal stop chunk.
#[derive(Debug, Clone)]
pub struct ChunkEmitter {
    id: String,
    model: String,
    created: u64,
}

impl ChunkEmitter {
    /// Start a chunk sequence for one streamed response.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: unix_now(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// The role-establishing first chunk.
    pub fn opener(&self) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some("assistant"),
                content: None,
            },
            None,
        )
    }

    /// One content fragment, emitted per incoming stream frame.
    pub fn delta(&self, content: String) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: None,
                content: Some(content),
            },
            None,
        )
    }

    /// The terminal empty delta carrying `finish_reason: stop`.
    pub fn stop(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some("stop"))
    }
}

/// Model listing body.
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    /// Always `list`.
    pub object: &'static str,
    /// The single configured model.
    pub data: Vec<Model>,
}

/// One model entry.
#[derive(Debug, Serialize)]
pub struct Model {
    /// Model id.
    pub id: String,
    /// Always `model`.
    pub object: &'static str,
    /// Unknown; zero.
    pub created: u64,
    /// Owner label.
    pub owned_by: &'static str,
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
