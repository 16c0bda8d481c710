use thiserror::Error;

/// Result alias for index operations.
pub type RagResult<T> = std::result::Result<T, RagError>;

/// Retrieval index errors.
#[derive(Debug, Error)]
pub enum RagError {
    /// Filesystem failure under the cache directory.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted artifact could not be (de)serialised.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Manifest/checksum mismatch at load time. Fail closed: the index
    /// refuses to serve queries but the gateway keeps running.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// Network failure while crawling or fetching.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The lexical index rejected an operation.
    #[error("lexical index error: {0}")]
    Lexical(String),

    /// Embedding or reranking failure.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The crawl produced nothing to index.
    #[error("no indexable pages found under {0}")]
    EmptyCrawl(String),
}

impl From<tantivy::TantivyError> for RagError {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::Lexical(err.to_string())
    }
}
