//! Persisted data model of the index.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Version tag written into every manifest. Bump when the chunker or the
/// persisted layout changes shape; a mismatch forces a rebuild.
pub const INDEX_VERSION_TAG: &str = "toolgate-index-v1";

/// Search-granularity chunk. Children are what the retrievers rank; the
/// parent provides surrounding context at result time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable hash over (url, heading path, local index).
    pub chunk_id: String,
    /// Owning parent, when this chunk is a true child.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Chunk text as extracted.
    pub text: String,
    /// Deterministic cl100k token count of `text`.
    pub token_count: usize,
    /// Contextual prefix produced by the enrichment pass, prepended to
    /// the text at embedding time only.
    #[serde(default)]
    pub context_prefix: Option<String>,
    /// Location and flags.
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Text handed to the embedder: contextual prefix plus chunk text.
    pub fn embedding_text(&self) -> String {
        match &self.context_prefix {
            Some(prefix) => format!("{prefix}\n\n{}", self.text),
            None => self.text.clone(),
        }
    }
}

/// Context-granularity chunk returned alongside its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentChunk {
    /// Stable hash over (url, heading path, local index).
    pub parent_id: String,
    /// Full section text.
    pub text: String,
    /// Location and flags.
    pub metadata: ChunkMetadata,
}

/// Chunk location and retrieval flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source page URL.
    pub url: String,
    /// Heading stack from h1 down to the chunk's section.
    pub heading_path: Vec<String>,
    /// Coarse page classification derived from the URL path.
    pub doc_type: String,
    /// Identifiers mined from code blocks in the chunk.
    #[serde(default)]
    pub code_identifiers: Vec<String>,
    /// Set on parent chunks.
    #[serde(default)]
    pub is_parent: bool,
    /// Set when a childless parent is indexed as its own child.
    #[serde(default)]
    pub is_parent_as_child: bool,
    /// Invisible to retrievers; physically removed on rebuild.
    #[serde(default)]
    pub tombstoned: bool,
}

/// Cached page entry, stored at `pages/<sha256(url)[..32]>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Page URL.
    pub url: String,
    /// SHA-256 of the raw HTML.
    pub content_hash: String,
    /// ETag from the last fetch, when the server sent one.
    #[serde(default)]
    pub etag: Option<String>,
    /// Last-Modified header from the last fetch.
    #[serde(default)]
    pub last_modified: Option<String>,
    /// `lastmod` from the sitemap at fetch time.
    #[serde(default)]
    pub lastmod: Option<String>,
    /// Unix seconds when the entry was written.
    pub cached_at: u64,
    /// Raw HTML body.
    pub html: String,
}

/// Manifest guarding against loading a store built by a different chunker
/// or embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Layout/chunker version tag.
    pub index_version_tag: String,
    /// Embedding model the vectors were produced with.
    pub embedding_model_name: String,
    /// Hex SHA-256 of the serialised vector store.
    pub vector_store_checksum: String,
    /// Unix seconds when the manifest was written.
    pub created_at: u64,
    /// Child chunk count at write time.
    pub chunk_count: usize,
}

/// One URL discovered by the crawler, with its sitemap `lastmod`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitemapEntry {
    /// Page URL.
    pub url: String,
    /// W3C datetime string from the sitemap, when present.
    #[serde(default)]
    pub lastmod: Option<String>,
}

/// Persisted crawl bookkeeping: what is indexed, what keeps failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlState {
    /// URL → snapshot of what the index holds for it.
    #[serde(default)]
    pub indexed: BTreeMap<String, IndexedPage>,
    /// URL → consecutive failure count.
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
    /// URLs skipped after three consecutive failures.
    #[serde(default)]
    pub skip_list: BTreeSet<String>,
}

impl CrawlState {
    /// Consecutive failures before a URL lands on the skip list.
    pub const SKIP_AFTER_FAILURES: u32 = 3;

    /// Count one failed fetch; three strikes moves the URL to the skip
    /// list until a rebuild clears it.
    pub fn record_failure(&mut self, url: &str) {
        let count = self.failures.entry(url.to_string()).or_insert(0);
        *count += 1;

        if *count >= Self::SKIP_AFTER_FAILURES {
            log::warn!("Skipping {url} after {count} consecutive failures");
            self.skip_list.insert(url.to_string());
        }
    }

    /// A successful fetch clears the failure counter.
    pub fn record_success(&mut self, url: &str) {
        self.failures.remove(url);
        self.skip_list.remove(url);
    }
}

/// Snapshot of an indexed page used for sitemap diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedPage {
    /// Sitemap `lastmod` at index time.
    #[serde(default)]
    pub lastmod: Option<String>,
    /// SHA-256 of the extracted content at index time.
    pub content_hash: String,
}

/// Cached sub-sitemap set, persisted as `sitemap_cache.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitemapCache {
    /// Sub-sitemap URL → cached entry.
    #[serde(default)]
    pub sitemaps: BTreeMap<String, CachedSitemap>,
}

/// One cached sub-sitemap with the `lastmod` it was fetched at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSitemap {
    /// `lastmod` of the sub-sitemap in the parent index.
    #[serde(default)]
    pub lastmod: Option<String>,
    /// URLs the sub-sitemap contained.
    pub urls: Vec<SitemapEntry>,
}

/// One hybrid-search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Child chunk id.
    pub chunk_id: String,
    /// Source page URL.
    pub url: String,
    /// Heading stack of the chunk's section.
    pub heading_path: Vec<String>,
    /// Child text (search granularity).
    pub text: String,
    /// Parent text (context granularity).
    pub parent_text: String,
    /// Final score in [0, 1] after fusion (and reranking when enabled).
    pub score: f32,
}

/// Unix seconds now.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
