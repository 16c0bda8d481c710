//! Tool registry and dispatch.
//!
//! Tools are registered once at startup. Each registration derives an
//! immutable [`ToolDescriptor`] (name, description, JSON schema of the
//! arguments) that the backend adapter projects into whatever shape the
//! active dialect expects. Dispatch never fails the request: unknown
//! tools and invocation errors come back as error strings the model can
//! react to.

mod echo;
mod registry;

pub use echo::EchoTool;
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name; what the model calls.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Run the tool. Errors are turned into tool-error messages by the
    /// registry, never surfaced as protocol errors.
    async fn invoke(&self, arguments: Value) -> anyhow::Result<String>;
}

/// Immutable snapshot of a tool's interface, derived at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}
