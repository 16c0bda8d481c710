//! Background incremental updates.
//!
//! The updater wakes on an interval (or a forced wake), diffs the
//! current sitemap against the indexed set, processes changed URLs in
//! lastmod-descending batches, tombstones what changed or disappeared,
//! and forces a physical rebuild once tombstone pressure crosses the
//! configured threshold. It yields to foreground traffic between batches
//! and observes the cancellation flag at the same points.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::RagResult;
use crate::index::{DocsIndex, IndexState, apply_page};
use crate::lexical::LexicalIndex;
use crate::types::{IndexedPage, SitemapEntry};

/// Outcome of comparing the live sitemap against the indexed set.
#[derive(Debug, Default, PartialEq)]
pub struct SitemapDiff {
    /// URLs the index has never seen.
    pub new: Vec<SitemapEntry>,
    /// URLs whose lastmod changed, or compares as unknown on either
    /// side (content-hash comparison decides after the fetch).
    pub updated: Vec<SitemapEntry>,
    /// Indexed URLs absent from the live sitemap.
    pub removed: Vec<String>,
    /// URLs with matching lastmod on both sides.
    pub unchanged: Vec<String>,
}

/// Diff by URL + lastmod. A missing lastmod on either side compares as
/// unknown and lands in `updated` so the fetch can decide by content
/// hash.
pub(crate) fn diff_sitemap(current: &[SitemapEntry], indexed: &BTreeMap<String, IndexedPage>) -> SitemapDiff {
    let mut diff = SitemapDiff::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for entry in current {
        seen.insert(entry.url.as_str());

        match indexed.get(&entry.url) {
            None => diff.new.push(entry.clone()),
            Some(page) => match (&entry.lastmod, &page.lastmod) {
                (Some(current_mod), Some(indexed_mod)) if current_mod == indexed_mod => {
                    diff.unchanged.push(entry.url.clone());
                }
                _ => diff.updated.push(entry.clone()),
            },
        }
    }

    for url in indexed.keys() {
        if !seen.contains(url.as_str()) {
            diff.removed.push(url.clone());
        }
    }

    diff
}

/// Mark every chunk and parent of `url` tombstoned. Vectors stay in the
/// store; the flat layout cannot remove rows.
pub(crate) fn tombstone_url(state: &mut IndexState, url: &str) -> usize {
    let mut count = 0;

    for chunk in state.chunks.values_mut().filter(|c| c.metadata.url == url) {
        if !chunk.metadata.tombstoned {
            chunk.metadata.tombstoned = true;
            count += 1;
        }
    }

    for parent in state.parents.values_mut().filter(|p| p.metadata.url == url) {
        parent.metadata.tombstoned = true;
    }

    count
}

impl DocsIndex {
    /// Start the long-lived updater task.
    pub fn spawn_updater(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.updater_loop().await })
    }

    async fn updater_loop(&self) {
        log::info!(
            "Index updater running (interval {:?}, batch size {})",
            self.config.update_interval(),
            self.config.update_batch_size
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.update_interval()) => {}
                _ = self.wake.notified() => {
                    log::info!("Forced index update requested");
                }
                _ = self.cancel.cancelled() => break,
            }

            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_update_cycle().await {
                log::error!("Index update cycle failed: {e}");
            }
        }

        log::info!("Index updater stopped");
    }

    /// One full update cycle. Public within the crate for tests and the
    /// forced-update path.
    pub(crate) async fn run_update_cycle(&self) -> RagResult<()> {
        let mut sitemap_cache = {
            let state = self.state.read().await;
            state.sitemap_cache.clone()
        };

        let entries = crate::crawl::discover_urls(&self.config, &self.fetcher, &mut sitemap_cache).await?;

        let diff = {
            let mut state = self.state.write().await;
            state.sitemap_cache = sitemap_cache;
            diff_sitemap(&entries, &state.crawl_state.indexed)
        };

        log::info!(
            "Sitemap diff: {} new, {} updated, {} removed, {} unchanged",
            diff.new.len(),
            diff.updated.len(),
            diff.removed.len(),
            diff.unchanged.len()
        );

        // Freshest first, so the newest content becomes searchable first.
        let mut work: Vec<SitemapEntry> = diff.new.into_iter().chain(diff.updated).collect();
        work.sort_by(|a, b| b.lastmod.cmp(&a.lastmod));

        for batch in work.chunks(self.config.update_batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                log::info!("Update cycle cancelled between batches");
                return Ok(());
            }

            self.pause.yield_while_paused(&self.cancel).await;

            self.apply_update_batch(batch).await?;
        }

        // Removed URLs lose their chunks immediately.
        {
            let mut state = self.state.write().await;

            for url in &diff.removed {
                let tombstoned = tombstone_url(&mut state, url);
                state.crawl_state.indexed.remove(url);
                log::info!("Removed {url}: tombstoned {tombstoned} chunks");
            }
        }

        let ratio = {
            let state = self.state.read().await;
            state.tombstone_ratio()
        };

        if ratio > self.config.rebuild_threshold {
            log::info!(
                "Tombstone ratio {ratio:.2} exceeds threshold {}; rebuilding",
                self.config.rebuild_threshold
            );
            self.rebuild().await?;
        } else {
            let state = self.state.read().await;
            self.persist(&state).await?;
        }

        Ok(())
    }

    /// Fetch, process, and splice one batch. Network and embedding run
    /// without the lock; the write lock covers only the splice.
    async fn apply_update_batch(&self, batch: &[SitemapEntry]) -> RagResult<()> {
        let (skip_list, known_hashes): (_, BTreeMap<String, String>) = {
            let state = self.state.read().await;
            (
                state.crawl_state.skip_list.clone(),
                state
                    .crawl_state
                    .indexed
                    .iter()
                    .map(|(url, page)| (url.clone(), page.content_hash.clone()))
                    .collect(),
            )
        };

        let report = self.fetcher.fetch_all(batch, &skip_list, false).await;
        report.log_summary();

        // Unknown-lastmod URLs fall back to content-hash comparison: an
        // unchanged body is not reprocessed.
        let changed: Vec<_> = report
            .pages
            .iter()
            .filter(|page| known_hashes.get(&page.url) != Some(&page.content_hash))
            .cloned()
            .collect();

        let processed = self.process_pages(&changed, &HashSet::new()).await?;

        let mut state = self.state.write().await;

        for url in &report.failed_urls {
            state.crawl_state.record_failure(url);
        }

        // Unchanged bodies keep their chunks; only the recorded lastmod
        // moves forward so the next diff sees them as unchanged.
        for page in &report.pages {
            if known_hashes.get(&page.url) == Some(&page.content_hash)
                && let Some(indexed) = state.crawl_state.indexed.get_mut(&page.url)
            {
                indexed.lastmod = page.lastmod.clone();
            }
        }

        for page in processed {
            // Old chunks for the URL go invisible before the fresh ones
            // land, so a stale and a fresh copy never coexist.
            tombstone_url(&mut state, &page.url);

            let new_chunks: Vec<_> = page.chunked.children.clone();
            apply_page(&mut state, page)?;
            state.lexical.add_chunks(new_chunks.iter())?;
        }

        Ok(())
    }

    /// Physical rebuild: drop tombstoned chunks and parents, copy the
    /// surviving vector rows into a fresh store, and rebuild the lexical
    /// index. No re-crawl, no re-embedding.
    pub(crate) async fn rebuild(&self) -> RagResult<()> {
        let mut state = self.state.write().await;

        let before = state.chunks.len();
        state.chunks.retain(|_, chunk| !chunk.metadata.tombstoned);
        state.parents.retain(|_, parent| !parent.metadata.tombstoned);

        let live_ids: Vec<String> = state.chunks.keys().cloned().collect();
        let retained = state.vector.retain_rows(live_ids.iter())?;
        state.vector = retained;
        state.lexical = LexicalIndex::build(state.chunks.values())?;

        log::info!("Rebuild complete: {before} -> {} chunks", state.chunks.len());

        self.persist(&state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{Chunk, ChunkMetadata};

    fn entry(url: &str, lastmod: Option<&str>) -> SitemapEntry {
        SitemapEntry {
            url: url.to_string(),
            lastmod: lastmod.map(str::to_string),
        }
    }

    fn indexed(lastmod: Option<&str>) -> IndexedPage {
        IndexedPage {
            lastmod: lastmod.map(str::to_string),
            content_hash: "hash".to_string(),
        }
    }

    #[test]
    fn diff_classifies_all_four_ways() {
        let current = vec![
            entry("https://e.com/new", Some("2025-06-01")),
            entry("https://e.com/updated", Some("2025-06-02")),
            entry("https://e.com/unchanged", Some("2025-01-01")),
            entry("https://e.com/unknown", None),
        ];

        let mut index = BTreeMap::new();
        index.insert("https://e.com/updated".to_string(), indexed(Some("2025-05-01")));
        index.insert("https://e.com/unchanged".to_string(), indexed(Some("2025-01-01")));
        index.insert("https://e.com/unknown".to_string(), indexed(Some("2025-01-01")));
        index.insert("https://e.com/gone".to_string(), indexed(Some("2024-01-01")));

        let diff = diff_sitemap(&current, &index);

        assert_eq!(diff.new, vec![entry("https://e.com/new", Some("2025-06-01"))]);
        assert_eq!(diff.updated.len(), 2); // changed lastmod + unknown lastmod
        assert_eq!(diff.unchanged, vec!["https://e.com/unchanged".to_string()]);
        assert_eq!(diff.removed, vec!["https://e.com/gone".to_string()]);
    }

    #[test]
    fn missing_indexed_lastmod_is_unknown() {
        let current = vec![entry("https://e.com/a", Some("2025-06-01"))];
        let mut index = BTreeMap::new();
        index.insert("https://e.com/a".to_string(), indexed(None));

        let diff = diff_sitemap(&current, &index);
        assert_eq!(diff.updated.len(), 1);
        assert!(diff.unchanged.is_empty());
    }

    fn chunk_for(url: &str, id: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            parent_id: None,
            text: "text".to_string(),
            token_count: 1,
            context_prefix: None,
            metadata: ChunkMetadata {
                url: url.to_string(),
                heading_path: Vec::new(),
                doc_type: "page".to_string(),
                code_identifiers: Vec::new(),
                is_parent: false,
                is_parent_as_child: false,
                tombstoned: false,
            },
        }
    }

    #[test]
    fn tombstoning_is_per_url() {
        let mut state = IndexState::empty().unwrap();

        for (url, id) in [
            ("https://e.com/b", "b1"),
            ("https://e.com/b", "b2"),
            ("https://e.com/a", "a1"),
        ] {
            state.chunks.insert(id.to_string(), chunk_for(url, id));
        }

        let count = tombstone_url(&mut state, "https://e.com/b");

        assert_eq!(count, 2);
        assert!(state.chunks["b1"].metadata.tombstoned);
        assert!(state.chunks["b2"].metadata.tombstoned);
        assert!(!state.chunks["a1"].metadata.tombstoned);

        // Tombstoning again is idempotent.
        assert_eq!(tombstone_url(&mut state, "https://e.com/b"), 0);
    }

    #[test]
    fn tombstone_ratio_reflects_pressure() {
        let mut state = IndexState::empty().unwrap();

        for id in ["a", "b", "c", "d"] {
            state.chunks.insert(id.to_string(), chunk_for("https://e.com/x", id));
        }

        assert_eq!(state.tombstone_ratio(), 0.0);

        tombstone_url(&mut state, "https://e.com/x");
        assert_eq!(state.tombstone_ratio(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn updater_stops_promptly_on_shutdown() {
        let index = DocsIndex::test_instance();
        let handle = Arc::clone(&index).spawn_updater();

        // Let the task reach its select.
        tokio::time::sleep(Duration::from_millis(10)).await;

        index.shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("updater should stop within one batch of work")
            .unwrap();
    }
}
