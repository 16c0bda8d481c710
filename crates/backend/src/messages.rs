//! Dialect-agnostic message types.
//!
//! Both wire dialects are normalised to these shapes: an assistant
//! message optionally carrying an ordered list of tool calls, and a
//! stream of delta frames that [`StreamAccumulator`] folds back into the
//! same final shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role.
    pub role: Role,
    /// Text content; may be empty on tool-calling assistant messages.
    pub content: String,
    /// Tool calls carried by an assistant message, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// On tool messages, the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// An assistant message without tool calls.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// A tool-result message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A structured intent to invoke a named tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Stable call id; synthesised when the dialect provides none.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// Tool-choice value sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call a tool.
    Required,
    /// Tools are disabled.
    None,
}

impl ToolChoice {
    /// Wire representation, identical in both dialects.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
            Self::None => "none",
        }
    }
}

impl From<config::ToolChoiceMode> for ToolChoice {
    fn from(mode: config::ToolChoiceMode) -> Self {
        match mode {
            config::ToolChoiceMode::Auto => Self::Auto,
            config::ToolChoiceMode::Required => Self::Required,
            config::ToolChoiceMode::None => Self::None,
        }
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Token budget exhausted.
    Length,
    /// The response carries tool calls.
    ToolCalls,
}

impl FinishReason {
    pub(crate) fn parse(raw: &str) -> Self {
        match raw {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            _ => Self::Stop,
        }
    }
}

/// Normalised result of one backend call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The assistant message, tool calls included.
    pub message: ChatMessage,
    /// Finish reason when the dialect reported one.
    pub finish_reason: Option<FinishReason>,
}

impl ChatOutcome {
    /// Tool calls carried by the assistant message.
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        &self.message.tool_calls
    }

    /// Whether the model asked for tool execution.
    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }
}

/// One streaming delta frame, already decoded from the wire.
#[derive(Debug, Clone, Default)]
pub struct StreamFrame {
    /// Content to append.
    pub content: Option<String>,
    /// Tool-call fragments keyed by call index.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Finish reason, present on the terminal frame.
    pub finish_reason: Option<FinishReason>,
}

/// Incremental tool-call data; arrives in fragments keyed by index.
#[derive(Debug, Clone)]
pub struct ToolCallFragment {
    /// Position of the call in the final ordered list.
    pub index: usize,
    /// Call id, present on the first fragment of a call (if the dialect
    /// assigns ids at all).
    pub id: Option<String>,
    /// Tool name, present on the first fragment of a call.
    pub name: Option<String>,
    /// Argument JSON to append.
    pub arguments: String,
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reducer folding [`StreamFrame`]s into a final [`ChatOutcome`].
///
/// Content deltas concatenate; tool-call fragments concatenate per index;
/// finalised calls are emitted ordered by index at stream end.
#[derive(Default)]
pub struct StreamAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    finish_reason: Option<FinishReason>,
}

impl StreamAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame.
    pub fn feed(&mut self, frame: StreamFrame) {
        if let Some(content) = frame.content {
            self.content.push_str(&content);
        }

        for fragment in frame.tool_calls {
            let call = self.calls.entry(fragment.index).or_default();

            if let Some(id) = fragment.id {
                call.id = Some(id);
            }

            if let Some(name) = fragment.name {
                call.name = name;
            }

            call.arguments.push_str(&fragment.arguments);
        }

        if frame.finish_reason.is_some() {
            self.finish_reason = frame.finish_reason;
        }
    }

    /// Content accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Finalise into the normalised outcome.
    pub fn finish(self) -> ChatOutcome {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCallRequest {
                id: call.id.unwrap_or_else(synthesize_call_id),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            })
            .collect();

        let finish_reason = if tool_calls.is_empty() {
            self.finish_reason
        } else {
            Some(FinishReason::ToolCalls)
        };

        ChatOutcome {
            message: ChatMessage {
                role: Role::Assistant,
                content: self.content,
                tool_calls,
                tool_call_id: None,
            },
            finish_reason,
        }
    }
}

/// Stable call id for dialects that do not assign one.
pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Parse accumulated argument JSON; malformed argument text is preserved
/// as a string so the tool error names what the model produced.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
