//! The document index.
//!
//! [`DocsIndex`] owns the chunk table, parent table, page cache, vector
//! store, lexical index, and manifest. Searches take a read lock;
//! builds, incremental updates, rebuilds, and enrichment swap-ins take
//! the write lock, and never hold it across network or embedding work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkedPage, ChunkerConfig, chunk_page};
use crate::embed::Embedder;
use crate::error::{RagError, RagResult};
use crate::extract::extract_content;
use crate::fetch::{FetchedPage, Fetcher};
use crate::lexical::LexicalIndex;
use crate::rerank::Reranker;
use crate::search::{RRF_K, RetrieverRanking, min_max_normalize, rrf_fuse};
use crate::signals::{PauseGuard, PauseSignal};
use crate::store::{Store, sha256_hex};
use crate::types::{
    Chunk, CrawlState, INDEX_VERSION_TAG, IndexManifest, IndexedPage, ParentChunk, SearchResult, SitemapCache,
    SitemapEntry, unix_now,
};
use crate::vector::VectorStore;

pub(crate) struct IndexState {
    pub chunks: HashMap<String, Chunk>,
    pub parents: HashMap<String, ParentChunk>,
    pub vector: VectorStore,
    pub lexical: LexicalIndex,
    pub crawl_state: CrawlState,
    pub sitemap_cache: SitemapCache,
}

impl IndexState {
    pub(crate) fn empty() -> RagResult<Self> {
        Ok(Self {
            chunks: HashMap::new(),
            parents: HashMap::new(),
            vector: VectorStore::new(),
            lexical: LexicalIndex::new()?,
            crawl_state: CrawlState::default(),
            sitemap_cache: SitemapCache::default(),
        })
    }

    pub(crate) fn tombstone_ratio(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }

        let tombstoned = self.chunks.values().filter(|c| c.metadata.tombstoned).count();
        tombstoned as f64 / self.chunks.len() as f64
    }

    fn is_live(&self, chunk_id: &str) -> bool {
        self.chunks
            .get(chunk_id)
            .is_some_and(|chunk| !chunk.metadata.tombstoned)
    }
}

/// Everything one page contributes to the index.
pub(crate) struct ProcessedPage {
    pub url: String,
    pub lastmod: Option<String>,
    pub content_hash: String,
    pub chunked: ChunkedPage,
    pub embeddings: Vec<(String, Vec<f32>)>,
}

/// The retrieval index over one documentation site.
pub struct DocsIndex {
    pub(crate) config: config::RagConfig,
    pub(crate) chunker: ChunkerConfig,
    pub(crate) store: Store,
    pub(crate) fetcher: Fetcher,
    pub(crate) embedder: Embedder,
    pub(crate) reranker: Option<Reranker>,
    pub(crate) state: RwLock<IndexState>,
    pub(crate) pause: PauseSignal,
    pub(crate) cancel: CancellationToken,
    pub(crate) wake: Notify,
}

impl DocsIndex {
    /// Load the persisted index, or build it from a fresh crawl. A
    /// corrupted store fails closed with [`RagError::IndexCorruption`];
    /// the caller keeps serving non-RAG traffic.
    pub async fn open(config: config::RagConfig) -> RagResult<Arc<Self>> {
        let store = Store::new(&config.cache_dir);
        store.ensure_layout()?;

        let fetcher = Fetcher::new(&config, store.clone())?;
        let embedder = Embedder::new(config.embedding_model.clone());
        let reranker = config
            .rerank_enabled
            .then(|| Reranker::new(config.rerank_model.clone()));

        let index = Arc::new(Self {
            chunker: ChunkerConfig::from(&config),
            store,
            fetcher,
            embedder,
            reranker,
            state: RwLock::new(IndexState::empty()?),
            pause: PauseSignal::new(),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            config,
        });

        match index.load_persisted().await? {
            Some(loaded) => {
                log::info!(
                    "Loaded persisted index: {} chunks, {} parents",
                    loaded.chunks.len(),
                    loaded.parents.len()
                );
                *index.state.write().await = loaded;
            }
            None => {
                log::info!("No persisted index; building from a fresh crawl");
                index.full_build(false).await?;
            }
        }

        Ok(index)
    }

    /// Advisory pause for the duration of a foreground request.
    pub fn pause_guard(&self) -> PauseGuard {
        self.pause.guard()
    }

    /// Ask the background updater to run immediately.
    pub fn request_update(&self) {
        self.wake.notify_one();
    }

    /// Signal background tasks to stop; they observe it between batches.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Live (non-tombstoned) child chunk count.
    pub async fn chunk_count(&self) -> usize {
        let state = self.state.read().await;
        state.chunks.values().filter(|c| !c.metadata.tombstoned).count()
    }

    /// Hybrid search: lexical + semantic fused with weighted RRF, then
    /// cross-encoder reranking when enabled. Tombstoned chunks are
    /// filtered before fusion; every hit carries its parent text.
    pub async fn search(&self, query: &str) -> RagResult<Vec<SearchResult>> {
        let query_vector = self.embedder.embed_query(query).await?;
        let pool = self.config.candidate_pool().max(1);

        let candidates = {
            let state = self.state.read().await;
            hybrid_candidates(
                &state,
                query,
                &query_vector,
                pool,
                self.config.hybrid_lexical_weight,
                self.config.hybrid_semantic_weight,
            )?
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = candidates;

        if let Some(reranker) = &self.reranker {
            let texts: Vec<String> = results.iter().map(|c| c.text.clone()).collect();
            let raw_scores = reranker.score(query, texts).await?;
            let normalized = min_max_normalize(&raw_scores);

            for (candidate, score) in results.iter_mut().zip(normalized) {
                candidate.score = score;
            }

            results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        }

        results.truncate(self.config.search_top_k);

        Ok(results)
    }

    async fn load_persisted(&self) -> RagResult<Option<IndexState>> {
        let Some(manifest) = self.store.load_json::<IndexManifest>(&self.store.manifest_path())? else {
            return Ok(None);
        };

        if manifest.index_version_tag != INDEX_VERSION_TAG {
            log::warn!(
                "Index version tag '{}' does not match '{INDEX_VERSION_TAG}'; rebuilding",
                manifest.index_version_tag
            );
            return Ok(None);
        }

        let chunks: Vec<Chunk> = self.store.load_json(&self.store.chunks_path())?.unwrap_or_default();
        let parents: Vec<ParentChunk> = self.store.load_json(&self.store.parents_path())?.unwrap_or_default();
        let crawl_state: CrawlState = self.store.load_json(&self.store.crawl_state_path())?.unwrap_or_default();
        let sitemap_cache: SitemapCache = self
            .store
            .load_json(&self.store.sitemap_cache_path())?
            .unwrap_or_default();

        // Fail closed on checksum mismatch.
        let vector_bytes = self.store.verify_vector_store(&manifest.vector_store_checksum)?;

        let vector = if manifest.embedding_model_name != self.config.embedding_model {
            log::warn!(
                "Embedding model changed ('{}' -> '{}'); re-embedding {} chunks without re-crawling",
                manifest.embedding_model_name,
                self.config.embedding_model,
                chunks.len()
            );
            self.reembed_chunks(&chunks).await?
        } else {
            VectorStore::from_bytes(&vector_bytes)?
        };

        // The lexical index and the child→parent mapping are rebuilt
        // from the chunk table on every load; neither is persisted.
        let lexical = LexicalIndex::build(chunks.iter())?;

        let state = IndexState {
            chunks: chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect(),
            parents: parents.into_iter().map(|p| (p.parent_id.clone(), p)).collect(),
            vector,
            lexical,
            crawl_state,
            sitemap_cache,
        };

        if manifest.embedding_model_name != self.config.embedding_model {
            self.persist(&state).await?;
        }

        Ok(Some(state))
    }

    async fn reembed_chunks(&self, chunks: &[Chunk]) -> RagResult<VectorStore> {
        let texts: Vec<String> = chunks.iter().map(Chunk::embedding_text).collect();
        let vectors = self.embedder.embed(texts).await?;

        let mut store = VectorStore::new();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            store.upsert(&chunk.chunk_id, vector)?;
        }

        Ok(store)
    }

    /// Crawl, extract, chunk, embed, and swap in a fresh index.
    pub(crate) async fn full_build(&self, force_refresh: bool) -> RagResult<()> {
        let mut sitemap_cache = {
            let state = self.state.read().await;
            state.sitemap_cache.clone()
        };

        let entries = crate::crawl::discover_urls(&self.config, &self.fetcher, &mut sitemap_cache).await?;

        if entries.is_empty() {
            return Err(RagError::EmptyCrawl(self.config.base_url.clone()));
        }

        let mut crawl_state = CrawlState::default();
        let report = self.fetcher.fetch_all(&entries, &crawl_state.skip_list, force_refresh).await;
        report.log_summary();

        for url in &report.failed_urls {
            crawl_state.record_failure(url);
        }

        let processed = self.process_pages(&report.pages, &HashSet::new()).await?;

        let mut state = IndexState::empty()?;
        state.sitemap_cache = sitemap_cache;
        state.crawl_state = crawl_state;

        for page in processed {
            apply_page(&mut state, page)?;
        }

        if state.chunks.is_empty() {
            return Err(RagError::EmptyCrawl(self.config.base_url.clone()));
        }

        state.lexical = LexicalIndex::build(state.chunks.values())?;

        self.persist(&state).await?;

        log::info!(
            "Index built: {} chunks, {} parents from {} pages",
            state.chunks.len(),
            state.parents.len(),
            state.crawl_state.indexed.len()
        );

        *self.state.write().await = state;
        Ok(())
    }

    /// Extract, dedup, chunk, and embed a batch of fetched pages. Pure
    /// CPU and embedding work; no index lock is held.
    pub(crate) async fn process_pages(
        &self,
        pages: &[FetchedPage],
        known_content_hashes: &HashSet<String>,
    ) -> RagResult<Vec<ProcessedPage>> {
        let mut seen_hashes: HashSet<String> = known_content_hashes.clone();
        let mut processed = Vec::new();

        for page in pages {
            let Ok(url) = url::Url::parse(&page.url) else {
                continue;
            };

            let extracted = extract_content(&page.html, &url);

            // Duplicate extracted content after the first is skipped.
            if !seen_hashes.insert(sha256_hex(extracted.as_bytes())) {
                log::debug!("Skipping {} (duplicate content)", page.url);
                continue;
            }

            let chunked = chunk_page(&page.url, &extracted, &self.chunker);

            if chunked.children.is_empty() {
                log::debug!("No chunks produced for {}", page.url);
                continue;
            }

            let texts: Vec<String> = chunked.children.iter().map(Chunk::embedding_text).collect();
            let vectors = self.embedder.embed(texts).await?;

            let embeddings = chunked
                .children
                .iter()
                .map(|chunk| chunk.chunk_id.clone())
                .zip(vectors)
                .collect();

            // Raw-page hash: what the updater compares on fetch when a
            // lastmod is unknown.
            processed.push(ProcessedPage {
                url: page.url.clone(),
                lastmod: page.lastmod.clone(),
                content_hash: page.content_hash.clone(),
                chunked,
                embeddings,
            });
        }

        Ok(processed)
    }

    /// Persist every artifact plus a fresh manifest, atomically per file.
    pub(crate) async fn persist(&self, state: &IndexState) -> RagResult<()> {
        let chunks: Vec<&Chunk> = state.chunks.values().collect();
        let parents: Vec<&ParentChunk> = state.parents.values().collect();

        self.store.write_json(&self.store.chunks_path(), &chunks)?;
        self.store.write_json(&self.store.parents_path(), &parents)?;
        self.store.write_json(&self.store.crawl_state_path(), &state.crawl_state)?;
        self.store
            .write_json(&self.store.sitemap_cache_path(), &state.sitemap_cache)?;

        let checksum = self.store.write_vector_store(&state.vector.to_bytes())?;

        let manifest = IndexManifest {
            index_version_tag: INDEX_VERSION_TAG.to_string(),
            embedding_model_name: self.embedder.model_name().to_string(),
            vector_store_checksum: checksum,
            created_at: unix_now(),
            chunk_count: state.chunks.len(),
        };
        self.store.write_json(&self.store.manifest_path(), &manifest)?;

        Ok(())
    }

    /// URLs currently indexed, as sitemap entries for diffing.
    pub(crate) async fn indexed_entries(&self) -> Vec<SitemapEntry> {
        let state = self.state.read().await;
        state
            .crawl_state
            .indexed
            .iter()
            .map(|(url, page)| SitemapEntry {
                url: url.clone(),
                lastmod: page.lastmod.clone(),
            })
            .collect()
    }
}

/// Merge one processed page into the state: tombstones are not touched
/// here; new chunks, parents, vectors, and crawl bookkeeping are.
pub(crate) fn apply_page(state: &mut IndexState, page: ProcessedPage) -> RagResult<()> {
    for parent in page.chunked.parents {
        state.parents.insert(parent.parent_id.clone(), parent);
    }

    for chunk in page.chunked.children {
        state.chunks.insert(chunk.chunk_id.clone(), chunk);
    }

    for (chunk_id, vector) in page.embeddings {
        state.vector.upsert(&chunk_id, vector)?;
    }

    state.crawl_state.record_success(&page.url);
    state.crawl_state.indexed.insert(
        page.url,
        IndexedPage {
            lastmod: page.lastmod,
            content_hash: page.content_hash,
        },
    );

    Ok(())
}

/// A fused candidate before (optional) reranking.
pub(crate) type Candidate = SearchResult;

/// Run both retrievers, filter tombstones, and fuse. Pure with respect
/// to the given state; extracted for testability.
pub(crate) fn hybrid_candidates(
    state: &IndexState,
    query: &str,
    query_vector: &[f32],
    pool: usize,
    lexical_weight: f64,
    semantic_weight: f64,
) -> RagResult<Vec<Candidate>> {
    // Incremental updates re-add documents under the same chunk id, so
    // the lexical hits are deduplicated on top of the tombstone filter.
    let mut seen_lexical = HashSet::new();
    let lexical_ids: Vec<String> = state
        .lexical
        .search(query, pool * 2)?
        .into_iter()
        .filter(|(id, _)| state.is_live(id) && seen_lexical.insert(id.clone()))
        .take(pool)
        .map(|(id, _)| id)
        .collect();

    let semantic_ids: Vec<String> = state
        .vector
        .search(query_vector, pool, |id| state.is_live(id))
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    let fused = rrf_fuse(
        &[
            RetrieverRanking {
                weight: lexical_weight,
                ranked_ids: lexical_ids,
            },
            RetrieverRanking {
                weight: semantic_weight,
                ranked_ids: semantic_ids,
            },
        ],
        RRF_K,
    );

    let fused_scores: Vec<f32> = fused.iter().map(|(_, score)| *score as f32).collect();
    let normalized = min_max_normalize(&fused_scores);

    let mut candidates = Vec::new();

    for ((chunk_id, _), score) in fused.into_iter().zip(normalized).take(pool) {
        let Some(chunk) = state.chunks.get(&chunk_id) else {
            continue;
        };

        let parent_text = chunk
            .parent_id
            .as_ref()
            .and_then(|id| state.parents.get(id))
            .map(|parent| parent.text.clone())
            .unwrap_or_else(|| chunk.text.clone());

        candidates.push(Candidate {
            chunk_id,
            url: chunk.metadata.url.clone(),
            heading_path: chunk.metadata.heading_path.clone(),
            text: chunk.text.clone(),
            parent_text,
            score,
        });
    }

    Ok(candidates)
}

#[cfg(test)]
impl DocsIndex {
    /// An index with empty state and no persisted artifacts, for tests
    /// that exercise task lifecycle without any network or model work.
    pub(crate) fn test_instance() -> Arc<Self> {
        let config = config::RagConfig::default();
        let store = Store::new("target/ragdocs-test-cache");
        let fetcher = Fetcher::new(&config, store.clone()).expect("client builds offline");

        Arc::new(Self {
            chunker: ChunkerConfig::from(&config),
            store,
            fetcher,
            embedder: Embedder::new(config.embedding_model.clone()),
            reranker: None,
            state: RwLock::new(IndexState::empty().expect("empty state builds")),
            pause: PauseSignal::new(),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;

    fn test_chunk(id: &str, url: &str, text: &str, tombstoned: bool) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            parent_id: Some(format!("parent-{id}")),
            text: text.to_string(),
            token_count: 10,
            context_prefix: None,
            metadata: ChunkMetadata {
                url: url.to_string(),
                heading_path: vec!["Docs".to_string()],
                doc_type: "page".to_string(),
                code_identifiers: Vec::new(),
                is_parent: false,
                is_parent_as_child: false,
                tombstoned,
            },
        }
    }

    fn test_parent(id: &str, text: &str) -> ParentChunk {
        ParentChunk {
            parent_id: format!("parent-{id}"),
            text: text.to_string(),
            metadata: ChunkMetadata {
                url: "https://docs.example.com".to_string(),
                heading_path: Vec::new(),
                doc_type: "page".to_string(),
                code_identifiers: Vec::new(),
                is_parent: true,
                is_parent_as_child: false,
                tombstoned: false,
            },
        }
    }

    fn build_state(chunks: Vec<Chunk>, vectors: Vec<(&str, Vec<f32>)>) -> IndexState {
        let mut state = IndexState::empty().unwrap();

        for chunk in &chunks {
            state
                .parents
                .insert(format!("parent-{}", chunk.chunk_id), test_parent(&chunk.chunk_id, "parent text"));
        }

        state.lexical = LexicalIndex::build(chunks.iter()).unwrap();

        for chunk in chunks {
            state.chunks.insert(chunk.chunk_id.clone(), chunk);
        }

        for (id, vector) in vectors {
            state.vector.upsert(id, vector).unwrap();
        }

        state
    }

    #[test]
    fn tombstoned_chunks_never_surface() {
        // URLs A and C stay live; B is tombstoned after an incremental
        // removal. Its vectors remain in the store.
        let state = build_state(
            vec![
                test_chunk("chunk-a", "https://docs.example.com/a", "gateway retry policy details", false),
                test_chunk("chunk-b", "https://docs.example.com/b", "gateway retry policy details b", true),
                test_chunk("chunk-c", "https://docs.example.com/c", "unrelated streaming notes", false),
            ],
            vec![
                ("chunk-a", vec![1.0, 0.0]),
                ("chunk-b", vec![1.0, 0.1]),
                ("chunk-c", vec![0.0, 1.0]),
            ],
        );

        let candidates = hybrid_candidates(&state, "retry policy", &[1.0, 0.0], 10, 0.3, 0.7).unwrap();

        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.chunk_id != "chunk-b"));
        assert!(candidates.iter().any(|c| c.chunk_id == "chunk-a"));
    }

    #[test]
    fn candidates_carry_parent_text() {
        let state = build_state(
            vec![test_chunk("chunk-a", "https://docs.example.com/a", "child text here", false)],
            vec![("chunk-a", vec![1.0, 0.0])],
        );

        let candidates = hybrid_candidates(&state, "child text", &[1.0, 0.0], 5, 0.3, 0.7).unwrap();

        assert_eq!(candidates[0].parent_text, "parent text");
        assert_eq!(candidates[0].text, "child text here");
    }

    #[test]
    fn apply_page_records_crawl_state() {
        let mut state = IndexState::empty().unwrap();
        state.crawl_state.failures.insert("https://docs.example.com/a".to_string(), 2);

        let page = ProcessedPage {
            url: "https://docs.example.com/a".to_string(),
            lastmod: Some("2025-06-01".to_string()),
            content_hash: "abc".to_string(),
            chunked: ChunkedPage {
                parents: vec![test_parent("x", "p")],
                children: vec![test_chunk("x", "https://docs.example.com/a", "text", false)],
            },
            embeddings: vec![("x".to_string(), vec![0.5, 0.5])],
        };

        apply_page(&mut state, page).unwrap();

        assert!(state.crawl_state.failures.is_empty());
        let indexed = &state.crawl_state.indexed["https://docs.example.com/a"];
        assert_eq!(indexed.lastmod.as_deref(), Some("2025-06-01"));
        assert_eq!(state.vector.len(), 1);
    }
}
