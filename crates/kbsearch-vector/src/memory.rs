use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tracing::{debug, info};

use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::{prepare_batch, VectorIndex};
use kbsearch_core::types::{ChunkRecord, RetrievalCandidate, SourceKind};

use crate::blob::{blob_dim, pack_vector, unpack_vector};
use crate::locks::DocLocks;
use crate::search::rank;
use crate::similarity::cosine_similarity;

struct StoredChunk {
    chunk: ChunkRecord,
    blob: Vec<u8>,
}

/// Process-local vector index keeping vectors as packed little-endian blobs.
///
/// Has no native similarity operator: every search is a software scan of
/// the knowledge base's rows with matching dimensionality.
#[derive(Default)]
pub struct MemoryVectorIndex {
    rows: RwLock<BTreeMap<(String, String), StoredChunk>>,
    locks: DocLocks,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_where(&self, pred: impl Fn(&StoredChunk) -> bool) -> usize {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, r| !pred(r));
        before - rows.len()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, kb_id: &str, doc_id: &str, filename: &str, generation: &str, chunks: &[ChunkRecord], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(Error::InvalidInput(format!("{} chunks but {} vectors", chunks.len(), vectors.len())));
        }
        let rows = prepare_batch(kb_id, doc_id, filename, generation, chunks)?;
        if vectors.iter().any(|v| v.is_empty()) {
            return Err(Error::InvalidInput("vectors must not be empty".into()));
        }
        let _guard = self.locks.lock(kb_id, doc_id).await;
        let mut table = self.rows.write();
        for (chunk, vector) in rows.into_iter().zip(vectors) {
            let key = (chunk.kb_id.clone(), chunk.chunk_id.clone());
            table.insert(key, StoredChunk { chunk, blob: pack_vector(vector) });
        }
        info!(kb_id, doc_id, generation, chunks = chunks.len(), "memory vector upsert");
        Ok(())
    }

    async fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        if doc_id.is_empty() {
            return Err(Error::InvalidInput("doc_id must not be empty".into()));
        }
        let _guard = self.locks.lock(kb_id, doc_id).await;
        let deleted = self.remove_where(|r| r.chunk.kb_id == kb_id && r.chunk.doc_id == doc_id);
        info!(kb_id, doc_id, deleted, "memory vector document deleted");
        Ok(())
    }

    async fn delete_collection(&self, kb_id: &str) -> Result<()> {
        let deleted = self.remove_where(|r| r.chunk.kb_id == kb_id);
        info!(kb_id, deleted, "memory vector collection deleted");
        Ok(())
    }

    async fn delete_stale_generation(&self, kb_id: &str, doc_id: &str, keep_chunk_ids: &[String]) -> Result<usize> {
        if doc_id.is_empty() {
            return Ok(0);
        }
        let _guard = self.locks.lock(kb_id, doc_id).await;
        Ok(self.remove_where(|r| {
            r.chunk.kb_id == kb_id && r.chunk.doc_id == doc_id && !keep_chunk_ids.contains(&r.chunk.chunk_id)
        }))
    }

    async fn delete_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<usize> {
        Ok(self.remove_where(|r| r.chunk.kb_id == kb_id && chunk_ids.contains(&r.chunk.chunk_id)))
    }

    async fn fetch_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<Vec<(ChunkRecord, Vec<f32>)>> {
        let rows = self.rows.read();
        let mut out = Vec::new();
        for id in chunk_ids {
            if let Some(r) = rows.get(&(kb_id.to_string(), id.clone())) {
                out.push((r.chunk.clone(), unpack_vector(&r.blob)?));
            }
        }
        Ok(out)
    }

    async fn search(&self, kb_id: &str, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievalCandidate>> {
        if top_k == 0 || query_vector.is_empty() {
            return Ok(Vec::new());
        }
        let dim = query_vector.len();
        let mut hits = Vec::new();
        {
            let rows = self.rows.read();
            for r in rows.values().filter(|r| r.chunk.kb_id == kb_id && blob_dim(&r.blob) == dim) {
                let v = unpack_vector(&r.blob)?;
                hits.push(RetrievalCandidate::from_chunk(&r.chunk, SourceKind::Vector, cosine_similarity(query_vector, &v)));
            }
        }
        debug!(kb_id, dim, scanned = hits.len(), "memory vector scan");
        Ok(rank(hits, top_k))
    }

    async fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>> {
        let rows = self.rows.read();
        let mut chunks: Vec<ChunkRecord> = rows
            .values()
            .filter(|r| r.chunk.kb_id == kb_id && r.chunk.doc_id == doc_id && range.contains(&r.chunk.chunk_index))
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by(|a, b| a.chunk_index.cmp(&b.chunk_index).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        Ok(chunks)
    }

    async fn count(&self, kb_id: &str) -> Result<usize> {
        Ok(self.rows.read().values().filter(|r| r.chunk.kb_id == kb_id).count())
    }
}
