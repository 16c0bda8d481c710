//! BM25 retriever over child chunks.
//!
//! The tantivy index lives in RAM and is rebuilt from the chunk table on
//! every load; persisting it would only add a second source of truth.

use std::sync::Mutex;

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, doc};

use crate::error::{RagError, RagResult};
use crate::types::Chunk;

const WRITER_HEAP_BYTES: usize = 30_000_000;

pub(crate) struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    id_field: Field,
    text_field: Field,
}

impl LexicalIndex {
    pub(crate) fn new() -> RagResult<Self> {
        let mut builder = Schema::builder();
        let id_field = builder.add_text_field("chunk_id", STRING | STORED);
        let text_field = builder.add_text_field("text", TEXT);
        let schema = builder.build();

        let index = Index::create_in_ram(schema);
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            id_field,
            text_field,
        })
    }

    /// Build an index holding every given chunk.
    pub(crate) fn build<C: std::borrow::Borrow<Chunk>>(chunks: impl Iterator<Item = C>) -> RagResult<Self> {
        let lexical = Self::new()?;
        lexical.add_chunks(chunks)?;
        Ok(lexical)
    }

    /// Add chunks and commit. Tombstoned chunks are not removed here;
    /// they are filtered at search time from the chunk table.
    pub(crate) fn add_chunks<C: std::borrow::Borrow<Chunk>>(&self, chunks: impl Iterator<Item = C>) -> RagResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RagError::Lexical("writer lock poisoned".to_string()))?;

        for chunk in chunks {
            let chunk = chunk.borrow();
            writer.add_document(doc!(
                self.id_field => chunk.chunk_id.as_str(),
                self.text_field => chunk.text.as_str(),
            ))?;
        }

        writer.commit()?;
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    /// BM25 top-`limit` as `(chunk_id, score)`, best first. Queries are
    /// parsed leniently so tantivy syntax characters cannot fail a
    /// search.
    pub(crate) fn search(&self, query: &str, limit: usize) -> RagResult<Vec<(String, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let (parsed, errors) = parser.parse_query_lenient(query);

        if !errors.is_empty() {
            log::debug!("Lenient query parse dropped {} term(s)", errors.len());
        }

        let searcher = self.reader.searcher();
        let top = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let document: TantivyDocument = searcher.doc(address)?;
            let Some(id) = document.get_first(self.id_field).and_then(|v| v.as_str()) else {
                continue;
            };
            hits.push((id.to_string(), score));
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            parent_id: None,
            text: text.to_string(),
            token_count: 0,
            context_prefix: None,
            metadata: ChunkMetadata {
                url: "https://docs.example.com".to_string(),
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
    fn ranks_matching_chunks_first() {
        let chunks = vec![
            chunk("c1", "configure the retry policy with exponential backoff"),
            chunk("c2", "streaming responses use server sent events"),
            chunk("c3", "the retry policy only covers connection failures"),
        ];

        let lexical = LexicalIndex::build(chunks.iter()).unwrap();
        let hits = lexical.search("retry policy", 3).unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(id, _)| id == "c1" || id == "c3"));
    }

    #[test]
    fn query_syntax_characters_do_not_fail() {
        let lexical = LexicalIndex::build(vec![chunk("c1", "plain text")].iter()).unwrap();
        assert!(lexical.search("AND OR (unbalanced\"", 5).is_ok());
    }

    #[test]
    fn incremental_adds_become_searchable() {
        let lexical = LexicalIndex::build(vec![chunk("c1", "first page")].iter()).unwrap();
        lexical.add_chunks(vec![chunk("c2", "incremental update batch")].iter()).unwrap();

        let hits = lexical.search("incremental", 5).unwrap();
        assert_eq!(hits[0].0, "c2");
    }
}
