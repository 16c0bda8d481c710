//! Cross-encoder reranking.

use std::sync::{Arc, Mutex};

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use tokio::sync::OnceCell;

use crate::error::{RagError, RagResult};

pub(crate) struct Reranker {
    model_name: String,
    engine: OnceCell<Arc<Mutex<TextRerank>>>,
}

impl Reranker {
    pub(crate) fn new(model_name: String) -> Self {
        Self {
            model_name,
            engine: OnceCell::new(),
        }
    }

    async fn engine(&self) -> RagResult<Arc<Mutex<TextRerank>>> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let name = self.model_name.clone();

                tokio::task::spawn_blocking(move || {
                    let model = resolve_reranker_model(&name);
                    log::info!("Loading reranker model {model:?}");

                    TextRerank::try_new(RerankInitOptions::new(model).with_show_download_progress(false))
                        .map(|engine| Arc::new(Mutex::new(engine)))
                        .map_err(|e| RagError::Embedding(format!("failed to load reranker: {e}")))
                })
                .await
                .map_err(|e| RagError::Embedding(format!("reranker init task failed: {e}")))?
            })
            .await?;

        Ok(Arc::clone(engine))
    }

    /// Score `documents` against `query`; returns raw cross-encoder
    /// scores positionally aligned with the input. Min-max normalisation
    /// happens in the search pipeline.
    pub(crate) async fn score(&self, query: &str, documents: Vec<String>) -> RagResult<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let engine = self.engine().await?;
        let query = query.to_string();
        let count = documents.len();

        tokio::task::spawn_blocking(move || {
            let mut guard = engine
                .lock()
                .map_err(|_| RagError::Embedding("reranker engine lock poisoned".to_string()))?;

            let results = guard
                .rerank(&query, documents.iter().collect(), false, None)
                .map_err(|e| RagError::Embedding(e.to_string()))?;

            let mut scores = vec![0.0f32; count];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }

            Ok(scores)
        })
        .await
        .map_err(|e| RagError::Embedding(format!("rerank task failed: {e}")))?
    }
}

pub(crate) fn resolve_reranker_model(name: &str) -> RerankerModel {
    match name {
        "BAAI/bge-reranker-base" | "bge-reranker-base" => RerankerModel::BGERerankerBase,
        "jinaai/jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
        other => {
            log::warn!("Unknown reranker model '{other}', using BAAI/bge-reranker-base");
            RerankerModel::BGERerankerBase
        }
    }
}
