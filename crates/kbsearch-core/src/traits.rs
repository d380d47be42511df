//! Seams between the retrieval pipeline and its backends and collaborators.
//!
//! Lexical search is synchronous (tantivy blocks on disk I/O); the pipeline
//! moves it onto a blocking thread. Everything that may wait on the network
//! or on LanceDB is async.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

use crate::error::{Error, Result};
use crate::types::{ChunkRecord, RetrievalCandidate};

pub trait LexicalIndex: Send + Sync {
    /// Replace every row of `(kb_id, doc_id)` with `chunks` in one commit.
    fn upsert(
        &self,
        kb_id: &str,
        doc_id: &str,
        filename: &str,
        generation: &str,
        chunks: &[ChunkRecord],
    ) -> Result<()>;
    fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()>;
    fn delete_collection(&self, kb_id: &str) -> Result<()>;
    fn search(
        &self,
        kb_id: &str,
        query: &str,
        top_k: usize,
        min_term_coverage: f64,
    ) -> Result<Vec<RetrievalCandidate>>;
    /// Chunks of one document whose `chunk_index` falls in `range`, ascending.
    fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>>;
    fn count(&self, kb_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Insert or replace rows by `(kb_id, chunk_id)`. Rows of the document
    /// that are not in `chunks` are left alone; see `delete_stale_generation`.
    async fn upsert(
        &self,
        kb_id: &str,
        doc_id: &str,
        filename: &str,
        generation: &str,
        chunks: &[ChunkRecord],
        vectors: &[Vec<f32>],
    ) -> Result<()>;
    async fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()>;
    async fn delete_collection(&self, kb_id: &str) -> Result<()>;
    /// Remove every row of the document whose id is not in `keep_chunk_ids`.
    /// Chunks without a document (`doc_id` empty) are never swept.
    async fn delete_stale_generation(&self, kb_id: &str, doc_id: &str, keep_chunk_ids: &[String]) -> Result<usize>;
    async fn delete_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<usize>;
    /// Stored rows and their vectors for `chunk_ids`; ids with no row are skipped.
    async fn fetch_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<Vec<(ChunkRecord, Vec<f32>)>>;
    /// Cosine search restricted to rows with the query's dimensionality.
    async fn search(&self, kb_id: &str, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievalCandidate>>;
    async fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>>;
    async fn count(&self, kb_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier of the model; cached query vectors are keyed by it.
    fn model_id(&self) -> &str;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Scores keyed by position in `documents`. Scores may fall outside `[0,1]`.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<HashMap<usize, f64>>;
}

/// Validate an upsert batch and stamp the call's identity onto every chunk.
///
/// Chunks may leave `kb_id`/`doc_id` empty; a non-empty value that disagrees
/// with the call is rejected, as are duplicate chunk ids or chunk indexes.
pub fn prepare_batch(
    kb_id: &str,
    doc_id: &str,
    filename: &str,
    generation: &str,
    chunks: &[ChunkRecord],
) -> Result<Vec<ChunkRecord>> {
    if kb_id.is_empty() {
        return Err(Error::InvalidInput("kb_id must not be empty".into()));
    }
    let mut ids = HashSet::new();
    let mut indexes = HashSet::new();
    let mut out = Vec::with_capacity(chunks.len());
    for c in chunks {
        if c.chunk_id.is_empty() {
            return Err(Error::InvalidInput(format!("chunk at index {} has an empty chunk_id", c.chunk_index)));
        }
        if !c.kb_id.is_empty() && c.kb_id != kb_id {
            return Err(Error::InvalidInput(format!("chunk {} belongs to kb '{}', not '{kb_id}'", c.chunk_id, c.kb_id)));
        }
        if !c.doc_id.is_empty() && c.doc_id != doc_id {
            return Err(Error::InvalidInput(format!("chunk {} belongs to doc '{}', not '{doc_id}'", c.chunk_id, c.doc_id)));
        }
        if !ids.insert(c.chunk_id.as_str()) {
            return Err(Error::InvalidInput(format!("duplicate chunk_id {}", c.chunk_id)));
        }
        if !indexes.insert(c.chunk_index) {
            return Err(Error::InvalidInput(format!("duplicate chunk_index {} in doc '{doc_id}'", c.chunk_index)));
        }
        out.push(ChunkRecord {
            chunk_id: c.chunk_id.clone(),
            kb_id: kb_id.to_string(),
            doc_id: doc_id.to_string(),
            filename: filename.to_string(),
            chunk_index: c.chunk_index,
            content: c.content.clone(),
            ingest_generation: generation.to_string(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, index: u32) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.into(),
            kb_id: String::new(),
            doc_id: String::new(),
            filename: String::new(),
            chunk_index: index,
            content: format!("content {id}"),
            ingest_generation: String::new(),
        }
    }

    #[test]
    fn prepare_batch_stamps_identity() {
        let out = prepare_batch("kb", "doc", "doc.txt", "g2", &[chunk("a", 0), chunk("b", 1)]).expect("valid");
        assert!(out.iter().all(|c| c.kb_id == "kb" && c.doc_id == "doc" && c.ingest_generation == "g2"));
        assert_eq!(out[1].filename, "doc.txt");
    }

    #[test]
    fn prepare_batch_rejects_duplicates_and_foreign_rows() {
        assert!(prepare_batch("kb", "doc", "", "g", &[chunk("a", 0), chunk("a", 1)]).is_err());
        assert!(prepare_batch("kb", "doc", "", "g", &[chunk("a", 0), chunk("b", 0)]).is_err());
        let mut foreign = chunk("a", 0);
        foreign.kb_id = "other".into();
        assert!(prepare_batch("kb", "doc", "", "g", &[foreign]).is_err());
        assert!(prepare_batch("", "doc", "", "g", &[chunk("a", 0)]).is_err());
    }
}
