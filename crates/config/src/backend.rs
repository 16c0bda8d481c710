//! Inference backend configuration settings.

use std::time::Duration;

use serde::Deserialize;

/// Which wire dialect the backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Native Ollama dialect (`/api/chat`, newline-delimited JSON streaming).
    #[default]
    Ollama,
    /// OpenAI-compatible dialect (`/v1/chat/completions`, SSE streaming).
    Openai,
}

/// Inference backend configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Wire dialect of the backend.
    pub backend_type: BackendType,
    /// Base URL of the backend, without a trailing slash.
    pub endpoint: String,
    /// Default model name for every request that does not override it.
    pub model: String,
    /// TCP connect budget in seconds.
    pub connect_timeout: u64,
    /// Whole-response read budget in seconds; covers streaming bodies.
    pub read_timeout: u64,
    /// Maximum retries for connection-class failures.
    pub retry_attempts: u32,
    /// First retry delay in seconds; doubles per attempt.
    pub retry_initial_delay: u64,
}

impl BackendConfig {
    /// Connect budget as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Read budget as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    /// Initial retry delay as a [`Duration`].
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_secs(self.retry_initial_delay)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Ollama,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: String::new(),
            connect_timeout: 5,
            read_timeout: 300,
            retry_attempts: 3,
            retry_initial_delay: 1,
        }
    }
}
