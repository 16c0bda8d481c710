//! Local embeddings.
//!
//! fastembed runs ONNX models on the blocking thread pool; the first use
//! downloads the model, so construction is lazy and never happens on the
//! request path unless a search needs it.

use std::sync::{Arc, Mutex};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;

use crate::error::{RagError, RagResult};

const EMBED_BATCH: usize = 32;

pub(crate) struct Embedder {
    model_name: String,
    engine: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl Embedder {
    pub(crate) fn new(model_name: String) -> Self {
        Self {
            model_name,
            engine: OnceCell::new(),
        }
    }

    pub(crate) fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn engine(&self) -> RagResult<Arc<Mutex<TextEmbedding>>> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let name = self.model_name.clone();

                tokio::task::spawn_blocking(move || {
                    let model = resolve_embedding_model(&name);
                    log::info!("Loading embedding model {model:?}");

                    TextEmbedding::try_new(InitOptions::new(model).with_show_download_progress(false))
                        .map(|engine| Arc::new(Mutex::new(engine)))
                        .map_err(|e| RagError::Embedding(format!("failed to load embedding model: {e}")))
                })
                .await
                .map_err(|e| RagError::Embedding(format!("embedding init task failed: {e}")))?
            })
            .await?;

        Ok(Arc::clone(engine))
    }

    /// Embed a batch of texts, in order.
    pub(crate) async fn embed(&self, texts: Vec<String>) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let engine = self.engine().await?;

        tokio::task::spawn_blocking(move || {
            let mut guard = engine
                .lock()
                .map_err(|_| RagError::Embedding("embedding engine lock poisoned".to_string()))?;

            guard
                .embed(texts, Some(EMBED_BATCH))
                .map_err(|e| RagError::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| RagError::Embedding(format!("embedding task failed: {e}")))?
    }

    /// Embed one query string.
    pub(crate) async fn embed_query(&self, query: &str) -> RagResult<Vec<f32>> {
        let mut vectors = self.embed(vec![query.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Embedding("embedder returned no vector".to_string()))
    }
}

/// Map a configured model name onto a bundled fastembed model, falling
/// back to the default with a warning rather than refusing to start.
pub(crate) fn resolve_embedding_model(name: &str) -> EmbeddingModel {
    match name {
        "BAAI/bge-small-en-v1.5" | "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" | "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "BAAI/bge-large-en-v1.5" | "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "sentence-transformers/all-MiniLM-L6-v2" | "all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
        "nomic-ai/nomic-embed-text-v1.5" | "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        "intfloat/multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
        other => {
            log::warn!("Unknown embedding model '{other}', using BAAI/bge-small-en-v1.5");
            EmbeddingModel::BGESmallENV15
        }
    }
}
