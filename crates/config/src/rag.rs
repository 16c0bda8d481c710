//! Retrieval index configuration settings.

use std::time::Duration;

use serde::Deserialize;

/// Minimum updater interval. Shorter configured intervals are floored here.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Retrieval index configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RagConfig {
    /// Whether the retrieval index is built and exposed as a tool.
    pub enabled: bool,
    /// Base URL of the documentation site to index.
    pub base_url: String,
    /// Directory holding every persisted index artifact.
    pub cache_dir: String,
    /// Maximum BFS depth for recursive crawling.
    pub max_crawl_depth: u32,
    /// Hard cap on pages per crawl; the freshest pages win.
    pub max_pages: usize,
    /// Per-request fetch budget in seconds.
    pub request_timeout: u64,
    /// Page cache entry lifetime in hours.
    pub page_cache_ttl_hours: u64,
    /// Background update interval in hours; floored at five minutes.
    pub update_interval_hours: f64,
    /// Pages processed per update batch.
    pub update_batch_size: usize,
    /// Tombstone ratio that forces a full rebuild.
    pub rebuild_threshold: f64,
    /// Target child chunk size in tokens.
    pub child_chunk_size: usize,
    /// Target parent chunk size in tokens.
    pub parent_chunk_size: usize,
    /// Lower bound for child chunks in tokens.
    pub child_chunk_min_tokens: usize,
    /// Lower bound for parent chunks in tokens.
    pub parent_chunk_min_tokens: usize,
    /// Weight of the lexical retriever's rank contributions.
    pub hybrid_lexical_weight: f64,
    /// Weight of the semantic retriever's rank contributions.
    pub hybrid_semantic_weight: f64,
    /// Results returned to the caller.
    pub search_top_k: usize,
    /// Candidate pool size = top_k × this multiplier.
    pub retriever_candidate_multiplier: usize,
    /// Whether the cross-encoder reranker runs after fusion.
    pub rerank_enabled: bool,
    /// Embedding model name, recorded in the index manifest.
    pub embedding_model: String,
    /// Cross-encoder model name.
    pub rerank_model: String,
    /// Whether the background contextual-prefix pass runs.
    pub contextual_retrieval_enabled: bool,
    /// Explicit URL list merged with (or replacing) discovered URLs.
    pub manual_urls: Vec<String>,
    /// When set, only `manual_urls` are crawled.
    pub manual_urls_exclusive: bool,
}

impl RagConfig {
    /// Per-request fetch budget as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Page cache TTL as a [`Duration`].
    pub fn page_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.page_cache_ttl_hours * 3600)
    }

    /// Effective update interval, never below [`MIN_UPDATE_INTERVAL`].
    pub fn update_interval(&self) -> Duration {
        let configured = Duration::from_secs_f64(self.update_interval_hours * 3600.0);
        configured.max(MIN_UPDATE_INTERVAL)
    }

    /// Candidate pool size handed to the reranker.
    pub fn candidate_pool(&self) -> usize {
        self.search_top_k * self.retriever_candidate_multiplier.max(1)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            cache_dir: "rag_cache".to_string(),
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
            embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
            rerank_model: "BAAI/bge-reranker-base".to_string(),
            contextual_retrieval_enabled: false,
            manual_urls: Vec::new(),
            manual_urls_exclusive: false,
        }
    }
}
