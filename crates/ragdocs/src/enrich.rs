//! Contextual retrieval enrichment.
//!
//! A background pass asks the backend for a one-sentence description of
//! where each chunk sits in its document, prepends it to the chunk text,
//! and re-embeds. Progress persists every fifty chunks so the pass is
//! resumable; the index stays searchable throughout, and requests see
//! whichever version is current.

use std::collections::BTreeSet;
use std::sync::Arc;

use backend::{Backend, ChatMessage, ChatParams, ToolChoice};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::RagResult;
use crate::index::DocsIndex;

const PERSIST_EVERY: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnrichProgress {
    completed: BTreeSet<String>,
}

struct EnrichItem {
    chunk_id: String,
    text: String,
    parent_text: String,
    heading_path: Vec<String>,
    url: String,
}

impl DocsIndex {
    /// Start the long-lived contextualiser task.
    pub fn spawn_enricher(self: Arc<Self>, backend: Arc<dyn Backend>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.enrich_loop(backend).await {
                log::error!("Contextual enrichment failed: {e}");
            }
        })
    }

    async fn enrich_loop(&self, backend: Arc<dyn Backend>) -> RagResult<()> {
        let mut progress: EnrichProgress = self
            .store
            .load_json(&self.store.context_progress_path())?
            .unwrap_or_default();

        let items: Vec<EnrichItem> = {
            let state = self.state.read().await;
            state
                .chunks
                .values()
                .filter(|chunk| !chunk.metadata.tombstoned && !progress.completed.contains(&chunk.chunk_id))
                .map(|chunk| EnrichItem {
                    chunk_id: chunk.chunk_id.clone(),
                    text: chunk.text.clone(),
                    parent_text: chunk
                        .parent_id
                        .as_ref()
                        .and_then(|id| state.parents.get(id))
                        .map(|parent| parent.text.clone())
                        .unwrap_or_default(),
                    heading_path: chunk.metadata.heading_path.clone(),
                    url: chunk.metadata.url.clone(),
                })
                .collect()
        };

        if items.is_empty() {
            log::info!("Contextual enrichment: nothing to do");
            return Ok(());
        }

        log::info!("Contextual enrichment: {} chunks pending", items.len());
        let mut since_persist = 0usize;

        for item in items {
            if self.cancel.is_cancelled() {
                log::info!("Contextual enrichment cancelled");
                break;
            }

            self.pause.yield_while_paused(&self.cancel).await;

            let prefix = match self.contextualise(backend.as_ref(), &item).await {
                Ok(prefix) => prefix,
                Err(e) => {
                    log::warn!("Context generation failed for {}: {e}", item.chunk_id);
                    continue;
                }
            };

            let embedding = self.embedder.embed(vec![format!("{prefix}\n\n{}", item.text)]).await?;
            let Some(vector) = embedding.into_iter().next() else {
                continue;
            };

            {
                let mut state = self.state.write().await;

                if let Some(chunk) = state.chunks.get_mut(&item.chunk_id) {
                    chunk.context_prefix = Some(prefix);
                }
                state.vector.upsert(&item.chunk_id, vector)?;
            }

            progress.completed.insert(item.chunk_id);
            since_persist += 1;

            if since_persist >= PERSIST_EVERY {
                since_persist = 0;
                self.persist_enrichment(&progress).await?;
            }
        }

        self.persist_enrichment(&progress).await?;
        log::info!("Contextual enrichment pass finished ({} done)", progress.completed.len());

        Ok(())
    }

    async fn contextualise(&self, backend: &dyn Backend, item: &EnrichItem) -> Result<String, backend::BackendError> {
        let location = if item.heading_path.is_empty() {
            item.url.clone()
        } else {
            format!("{} — {}", item.url, item.heading_path.join(" > "))
        };

        let prompt = format!(
            "Document section ({location}):\n{}\n\nPassage from that section:\n{}\n\n\
            Write one short sentence situating this passage within the document, \
            for use as a retrieval prefix. Answer with the sentence only.",
            clip(&item.parent_text, 4000),
            clip(&item.text, 2000),
        );

        let messages = [ChatMessage::user(prompt)];

        let outcome = backend
            .chat(ChatParams {
                messages: &messages,
                tools: &[],
                temperature: 0.1,
                tool_choice: ToolChoice::None,
                model_override: None,
            })
            .await?;

        Ok(outcome.message.content.trim().to_string())
    }

    async fn persist_enrichment(&self, progress: &EnrichProgress) -> RagResult<()> {
        self.store.write_json(&self.store.context_progress_path(), progress)?;

        let state = self.state.read().await;
        self.persist(&state).await
    }
}

fn clip(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }

    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_char_boundaries() {
        let text = "héllo wörld";
        let clipped = clip(text, 3);
        assert!(text.starts_with(clipped));
        assert!(clipped.len() <= 3);
        assert_eq!(clip("short", 100), "short");
    }
}
