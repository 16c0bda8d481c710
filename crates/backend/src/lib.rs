//! Backend adapter layer.
//!
//! Exposes one uniform chat surface over the two supported wire dialects
//! (native Ollama and OpenAI-compatible), with connection-class retry,
//! health probing, streaming transport, and per-call model override.

#![deny(missing_docs)]

mod error;
mod http_client;
mod messages;
mod provider;
mod retry;

pub use error::{BackendError, BackendResult};
pub use messages::{
    ChatMessage, ChatOutcome, FinishReason, Role, StreamAccumulator, StreamFrame, ToolCallFragment, ToolCallRequest,
    ToolChoice,
};
pub use provider::{Backend, ChatParams, FrameStream, RequestHook, from_config};
