//! Cache-directory persistence.
//!
//! Layout:
//!
//! ```text
//! <cache_dir>/
//!   manifest.json
//!   chunks.json
//!   parents.json
//!   sitemap_cache.json
//!   crawl_state.json
//!   context_progress.json
//!   pages/<sha256(url)[..32]>.json
//!   vector_store/store.bin
//!   vector_store/vector_store.sha256
//! ```
//!
//! Every JSON artifact is written atomically (tmp file + rename). The
//! vector store is binary with a hex SHA-256 sidecar that the manifest
//! must match; a mismatch fails closed at load time.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::error::{RagError, RagResult};
use crate::types::{PageRecord, unix_now};

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Key a URL into the page-cache namespace.
pub(crate) fn page_key(url: &str) -> String {
    sha256_hex(url.as_bytes())[..32].to_string()
}

#[derive(Clone)]
pub(crate) struct Store {
    root: PathBuf,
}

impl Store {
    pub(crate) fn new(cache_dir: &str) -> Self {
        Self {
            root: PathBuf::from(cache_dir),
        }
    }

    pub(crate) fn ensure_layout(&self) -> RagResult<()> {
        std::fs::create_dir_all(self.root.join("pages"))?;
        std::fs::create_dir_all(self.root.join("vector_store"))?;
        Ok(())
    }

    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub(crate) fn chunks_path(&self) -> PathBuf {
        self.root.join("chunks.json")
    }

    pub(crate) fn parents_path(&self) -> PathBuf {
        self.root.join("parents.json")
    }

    pub(crate) fn sitemap_cache_path(&self) -> PathBuf {
        self.root.join("sitemap_cache.json")
    }

    pub(crate) fn crawl_state_path(&self) -> PathBuf {
        self.root.join("crawl_state.json")
    }

    pub(crate) fn context_progress_path(&self) -> PathBuf {
        self.root.join("context_progress.json")
    }

    pub(crate) fn vector_store_path(&self) -> PathBuf {
        self.root.join("vector_store").join("store.bin")
    }

    pub(crate) fn vector_checksum_path(&self) -> PathBuf {
        self.root.join("vector_store").join("vector_store.sha256")
    }

    fn page_path(&self, url: &str) -> PathBuf {
        self.root.join("pages").join(format!("{}.json", page_key(url)))
    }

    /// Read a JSON artifact; absent files are `Ok(None)`.
    pub(crate) fn load_json<T: DeserializeOwned>(&self, path: &Path) -> RagResult<Option<T>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Write a JSON artifact atomically.
    pub(crate) fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> RagResult<()> {
        let raw = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &raw)
    }

    pub(crate) fn write_atomic(&self, path: &Path, bytes: &[u8]) -> RagResult<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Page-cache lookup honouring the TTL. Expired entries read as
    /// misses but stay on disk until overwritten.
    pub(crate) fn load_page(&self, url: &str, ttl_secs: u64) -> Option<PageRecord> {
        let record: PageRecord = self.load_json(&self.page_path(url)).ok().flatten()?;

        if unix_now().saturating_sub(record.cached_at) > ttl_secs {
            log::debug!("Page cache expired for {url}");
            return None;
        }

        Some(record)
    }

    pub(crate) fn write_page(&self, record: &PageRecord) -> RagResult<()> {
        self.write_json(&self.page_path(&record.url), record)
    }

    /// Verify the on-disk vector store against the manifest's checksum.
    pub(crate) fn verify_vector_store(&self, expected_checksum: &str) -> RagResult<Vec<u8>> {
        let bytes = std::fs::read(self.vector_store_path())
            .map_err(|e| RagError::IndexCorruption(format!("vector store unreadable: {e}")))?;

        let sidecar = std::fs::read_to_string(self.vector_checksum_path())
            .map_err(|e| RagError::IndexCorruption(format!("vector store checksum sidecar unreadable: {e}")))?;

        let actual = sha256_hex(&bytes);

        if actual != sidecar.trim() {
            return Err(RagError::IndexCorruption(
                "vector store does not match its checksum sidecar".to_string(),
            ));
        }

        if actual != expected_checksum {
            return Err(RagError::IndexCorruption(
                "vector store checksum does not match the manifest".to_string(),
            ));
        }

        Ok(bytes)
    }

    /// Write the vector store and its sidecar; returns the checksum for
    /// the manifest.
    pub(crate) fn write_vector_store(&self, bytes: &[u8]) -> RagResult<String> {
        let checksum = sha256_hex(bytes);
        self.write_atomic(&self.vector_store_path(), bytes)?;
        self.write_atomic(&self.vector_checksum_path(), checksum.as_bytes())?;
        Ok(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cache_round_trips_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_str().unwrap());
        store.ensure_layout().unwrap();

        let record = PageRecord {
            url: "https://docs.example.com/a".to_string(),
            content_hash: sha256_hex(b"<html></html>"),
            etag: None,
            last_modified: None,
            lastmod: Some("2025-06-01".to_string()),
            cached_at: unix_now(),
            html: "<html></html>".to_string(),
        };

        store.write_page(&record).unwrap();

        let loaded = store.load_page(&record.url, 3600).unwrap();
        assert_eq!(loaded.html, record.html);
        assert_eq!(loaded.content_hash, record.content_hash);
    }

    #[test]
    fn expired_pages_read_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_str().unwrap());
        store.ensure_layout().unwrap();

        let record = PageRecord {
            url: "https://docs.example.com/old".to_string(),
            content_hash: String::new(),
            etag: None,
            last_modified: None,
            lastmod: None,
            cached_at: unix_now() - 7200,
            html: String::new(),
        };

        store.write_page(&record).unwrap();
        assert!(store.load_page(&record.url, 3600).is_none());
    }

    #[test]
    fn vector_store_verification_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_str().unwrap());
        store.ensure_layout().unwrap();

        let checksum = store.write_vector_store(b"vectors").unwrap();
        assert!(store.verify_vector_store(&checksum).is_ok());

        // Manifest disagrees with the store.
        assert!(matches!(
            store.verify_vector_store("deadbeef"),
            Err(RagError::IndexCorruption(_))
        ));

        // Store tampered with after the sidecar was written.
        std::fs::write(store.vector_store_path(), b"tampered").unwrap();
        assert!(matches!(
            store.verify_vector_store(&checksum),
            Err(RagError::IndexCorruption(_))
        ));
    }

    #[test]
    fn page_keys_are_stable() {
        assert_eq!(page_key("https://a"), page_key("https://a"));
        assert_ne!(page_key("https://a"), page_key("https://b"));
        assert_eq!(page_key("https://a").len(), 32);
    }
}
