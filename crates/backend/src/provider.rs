//! The uniform adapter surface over both backend dialects.

pub(crate) mod ollama;
pub(crate) mod openai_compat;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tools::ToolDescriptor;

use crate::error::BackendResult;
use crate::messages::{ChatMessage, ChatOutcome, StreamFrame, ToolChoice};

/// Stream of decoded delta frames from one backend call.
pub type FrameStream = Pin<Box<dyn Stream<Item = BackendResult<StreamFrame>> + Send>>;

/// Observability callback invoked with `(backend_name, outgoing_payload)`
/// immediately before transmission.
pub type RequestHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Parameters of one backend call.
///
/// `model_override` is scoped to this call and never touches shared
/// state, so override isolation holds on every exit path by construction.
#[derive(Clone, Copy)]
pub struct ChatParams<'a> {
    /// Conversation so far, in order.
    pub messages: &'a [ChatMessage],
    /// Tools to offer; empty on final-synthesis calls.
    pub tools: &'a [ToolDescriptor],
    /// Sampling temperature.
    pub temperature: f32,
    /// Tool-choice value, always emitted explicitly.
    pub tool_choice: ToolChoice,
    /// Model for this call only, when differing from the default.
    pub model_override: Option<&'a str>,
}

/// Uniform request/response surface over a backend dialect.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One non-streaming chat call, normalised.
    async fn chat(&self, params: ChatParams<'_>) -> BackendResult<ChatOutcome>;

    /// One streaming chat call; frames decode dialect-specific deltas.
    async fn chat_stream(&self, params: ChatParams<'_>) -> BackendResult<FrameStream>;

    /// Cheap probe of the backend's listing endpoint. Distinguishes an
    /// absent service from one that is reachable with no loaded model.
    async fn health(&self) -> BackendResult<()>;

    /// Dialect name for logs and hooks.
    fn name(&self) -> &str;

    /// Model used when a call has no override.
    fn default_model(&self) -> &str;
}

/// Build the configured adapter.
pub fn from_config(config: &config::BackendConfig, hook: Option<RequestHook>) -> Arc<dyn Backend> {
    match config.backend_type {
        config::BackendType::Ollama => Arc::new(ollama::OllamaBackend::new(config, hook)),
        config::BackendType::Openai => Arc::new(openai_compat::OpenAiCompatBackend::new(config, hook)),
    }
}

/// Dialect-level tool descriptor; identical `function` wrapper shape in
/// both dialects.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProjectedTool {
    r#type: &'static str,
    function: ProjectedFunction,
}

#[derive(Debug, Clone, Serialize)]
struct ProjectedFunction {
    name: String,
    description: String,
    parameters: Value,
}

/// Project registry descriptors into the wire shape, flattening schema
/// features local backends reject.
pub(crate) fn project_tools(descriptors: &[ToolDescriptor]) -> Vec<ProjectedTool> {
    descriptors
        .iter()
        .map(|descriptor| ProjectedTool {
            r#type: "function",
            function: ProjectedFunction {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: flatten_schema(&descriptor.parameters),
            },
        })
        .collect()
}

/// Reduce a JSON schema to the plain-object subset local backends accept:
/// keep `type`/`properties`/`required`/`description`/`enum`/`items`, drop
/// metadata keys, and fall back to a bare object for non-object schemas.
pub(crate) fn flatten_schema(schema: &Value) -> Value {
    let Some(object) = schema.as_object() else {
        return serde_json::json!({"type": "object"});
    };

    if object.get("type").and_then(Value::as_str) != Some("object") && !object.contains_key("properties") {
        return serde_json::json!({"type": "object"});
    }

    const KEPT: &[&str] = &["type", "properties", "required", "description", "enum", "items"];

    let mut flattened = serde_json::Map::new();
    flattened.insert("type".to_string(), Value::String("object".to_string()));

    for (key, value) in object {
        if KEPT.contains(&key.as_str()) {
            flattened.insert(key.clone(), value.clone());
        }
    }

    Value::Object(flattened)
}

/// Invoke the request hook, swallowing panics with a log entry. The hook
/// is observability only and must never fail a request.
pub(crate) fn run_hook(hook: Option<&RequestHook>, backend_name: &str, payload: &Value) {
    let Some(hook) = hook else {
        return;
    };

    if catch_unwind(AssertUnwindSafe(|| hook(backend_name, payload))).is_err() {
        log::warn!("Request hook panicked for backend '{backend_name}'; ignoring");
    }
}
