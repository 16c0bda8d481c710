//! Toolgate configuration structures.
//!
//! The configuration is a frozen record assembled once at startup from
//! `TOOLGATE_`-prefixed environment variables and passed down to every
//! component. Nothing mutates it afterwards.

#![deny(missing_docs)]

mod backend;
mod chat;
mod loader;
mod rag;
mod server;

pub use backend::{BackendConfig, BackendType};
pub use chat::{ChatConfig, ToolChoiceMode};
pub use rag::RagConfig;
use serde::Deserialize;
pub use server::ServerConfig;

/// Main configuration structure for the toolgate gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Inference backend settings.
    pub backend: BackendConfig,
    /// Tool-loop and prompt settings.
    pub chat: ChatConfig,
    /// Retrieval index settings.
    pub rag: RagConfig,
}

impl Config {
    /// Assemble the configuration from `TOOLGATE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Config> {
        loader::from_env()
    }

    /// Validate cross-field constraints and log non-fatal warnings.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                bind_host: "127.0.0.1",
                bind_port: 8000,
                health_check_on_startup: true,
            },
            backend: BackendConfig {
                backend_type: Ollama,
                endpoint: "http://127.0.0.1:11434",
                model: "",
                connect_timeout: 5,
                read_timeout: 300,
                retry_attempts: 3,
                retry_initial_delay: 1,
            },
            chat: ChatConfig {
                max_tool_iterations: 5,
                tool_loop_timeout: 120,
                first_iteration_tool_choice: Auto,
                max_tool_result_chars: 20000,
                system_prompt_path: "system_prompt.txt",
                system_prompt_default: "You are a helpful assistant with access to tools.",
                default_temperature: 0.7,
            },
            rag: RagConfig {
                enabled: false,
                base_url: "",
                cache_dir: "rag_cache",
                max_crawl_depth: 3,
                max_pages: 500,
                request_timeout: 30,
                page_cache_ttl_hours: 24,
                update_interval_hours: 1.0,
                update_batch_size: 50,
                rebuild_threshold: 0.3,
                child_chunk_size: 350,
                parent_chunk_size: 900,
                child_chunk_min_tokens: 150,
                parent_chunk_min_tokens: 200,
                hybrid_lexical_weight: 0.3,
                hybrid_semantic_weight: 0.7,
                search_top_k: 5,
                retriever_candidate_multiplier: 4,
                rerank_enabled: true,
                embedding_model: "BAAI/bge-small-en-v1.5",
                rerank_model: "BAAI/bge-reranker-base",
                contextual_retrieval_enabled: false,
                manual_urls: [],
                manual_urls_exclusive: false,
            },
        }
        "#);
    }
}
