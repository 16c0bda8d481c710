//! Flat vector store.
//!
//! Append-only dense rows with cosine scoring. The flat layout cannot
//! remove rows; deleted chunks are tombstoned in the chunk table and
//! filtered at search time, and rows are physically dropped only when a
//! rebuild writes a fresh store.
//!
//! Serialised layout: magic, dims (u32 LE), row count (u32 LE), then per
//! row a 32-byte ASCII chunk id followed by `dims` f32 LE values.

use std::collections::HashMap;

use crate::error::{RagError, RagResult};

const MAGIC: &[u8; 8] = b"TGVECS1\0";
const ID_BYTES: usize = 32;

#[derive(Default)]
pub(crate) struct VectorStore {
    dims: usize,
    ids: Vec<String>,
    rows: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
}

impl VectorStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert or replace one row. The first row fixes the dimensionality.
    pub(crate) fn upsert(&mut self, chunk_id: &str, vector: Vec<f32>) -> RagResult<()> {
        if self.dims == 0 {
            self.dims = vector.len();
        } else if vector.len() != self.dims {
            return Err(RagError::Embedding(format!(
                "dimension mismatch: store has {}, vector has {}",
                self.dims,
                vector.len()
            )));
        }

        match self.by_id.get(chunk_id) {
            Some(&row) => self.rows[row] = vector,
            None => {
                self.by_id.insert(chunk_id.to_string(), self.rows.len());
                self.ids.push(chunk_id.to_string());
                self.rows.push(vector);
            }
        }

        Ok(())
    }

    /// Cosine top-k over rows whose id passes `keep`. Tombstone filtering
    /// happens here, before any fusion sees the candidates.
    pub(crate) fn search(&self, query: &[f32], limit: usize, keep: impl Fn(&str) -> bool) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .ids
            .iter()
            .zip(&self.rows)
            .filter(|(id, _)| keep(id))
            .map(|(id, row)| (id.clone(), cosine(query, row)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);
        scored
    }

    /// Copy the rows named by `ids` into a fresh store. Used by rebuilds
    /// to drop tombstoned rows without re-embedding.
    pub(crate) fn retain_rows(&self, ids: impl Iterator<Item = impl AsRef<str>>) -> RagResult<VectorStore> {
        let mut retained = VectorStore::new();

        for id in ids {
            let id = id.as_ref();
            if let Some(&row) = self.by_id.get(id) {
                retained.upsert(id, self.rows[row].clone())?;
            }
        }

        Ok(retained)
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.rows.len() * (ID_BYTES + self.dims * 4));
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.dims as u32).to_le_bytes());
        out.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());

        for (id, row) in self.ids.iter().zip(&self.rows) {
            let mut id_bytes = [0u8; ID_BYTES];
            let src = id.as_bytes();
            let n = src.len().min(ID_BYTES);
            id_bytes[..n].copy_from_slice(&src[..n]);
            out.extend_from_slice(&id_bytes);

            for value in row {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> RagResult<VectorStore> {
        let corrupt = |why: &str| RagError::IndexCorruption(format!("vector store: {why}"));

        if bytes.len() < MAGIC.len() + 8 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad header"));
        }

        let dims = u32::from_le_bytes(bytes[8..12].try_into().map_err(|_| corrupt("bad dims"))?) as usize;
        let count = u32::from_le_bytes(bytes[12..16].try_into().map_err(|_| corrupt("bad count"))?) as usize;

        let row_size = ID_BYTES + dims * 4;
        let expected = 16 + count * row_size;

        if bytes.len() != expected {
            return Err(corrupt("truncated body"));
        }

        let mut store = VectorStore::new();

        for row_index in 0..count {
            let offset = 16 + row_index * row_size;
            let id_raw = &bytes[offset..offset + ID_BYTES];
            let id_end = id_raw.iter().position(|&b| b == 0).unwrap_or(ID_BYTES);
            let id = std::str::from_utf8(&id_raw[..id_end])
                .map_err(|_| corrupt("non-utf8 id"))?
                .to_string();

            let mut row = Vec::with_capacity(dims);
            for value_index in 0..dims {
                let at = offset + ID_BYTES + value_index * 4;
                row.push(f32::from_le_bytes(
                    bytes[at..at + 4].try_into().map_err(|_| corrupt("bad value"))?,
                ));
            }

            store.upsert(&id, row)?;
        }

        Ok(store)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VectorStore {
        let mut store = VectorStore::new();
        store.upsert("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", vec![1.0, 0.0, 0.0]).unwrap();
        store.upsert("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", vec![0.0, 1.0, 0.0]).unwrap();
        store.upsert("cccccccccccccccccccccccccccccccc", vec![0.7, 0.7, 0.0]).unwrap();
        store
    }

    #[test]
    fn cosine_search_ranks_by_similarity() {
        let store = sample();
        let hits = store.search(&[1.0, 0.0, 0.0], 2, |_| true);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn keep_filter_applies_before_ranking() {
        let store = sample();
        let hits = store.search(&[1.0, 0.0, 0.0], 3, |id| !id.starts_with('a'));

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(id, _)| !id.starts_with('a')));
    }

    #[test]
    fn round_trips_through_bytes() {
        let store = sample();
        let bytes = store.to_bytes();
        let restored = VectorStore::from_bytes(&bytes).unwrap();

        assert_eq!(restored.len(), 3);
        assert_eq!(restored.to_bytes(), bytes);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut store = sample();
        store.upsert("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", vec![0.0, 0.0, 1.0]).unwrap();

        assert_eq!(store.len(), 3);
        let hits = store.search(&[0.0, 0.0, 1.0], 1, |_| true);
        assert_eq!(hits[0].0, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut store = sample();
        assert!(store.upsert("dddddddddddddddddddddddddddddddd", vec![1.0]).is_err());
    }

    #[test]
    fn truncated_bytes_fail_closed() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            VectorStore::from_bytes(&bytes[..bytes.len() - 3]),
            Err(RagError::IndexCorruption(_))
        ));
    }

    #[test]
    fn retain_rows_drops_unnamed_ids() {
        let store = sample();
        let retained = store
            .retain_rows(["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "cccccccccccccccccccccccccccccccc"].iter())
            .unwrap();

        assert_eq!(retained.len(), 2);
    }
}
