use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::{LexicalIndex, VectorIndex};
use kbsearch_core::types::ChunkRecord;

/// Outcome of ingesting one document generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub chunks: usize,
    pub stale_removed: usize,
}

/// Stored vector rows grouped so each group can go back through one upsert.
type RowGroups = BTreeMap<(String, String, String, usize), (Vec<ChunkRecord>, Vec<Vec<f32>>)>;

/// Writes document generations to both indexes.
///
/// Order is vector upsert, lexical upsert, then removal of the previous
/// generation's vector rows. If the lexical write fails, chunk ids new to
/// the vector index are removed and rows the upsert overwrote are written
/// back, so the old generation stays searchable in both indexes.
///
/// Chunks ingested without a `doc_id` are never swept as stale; they only
/// leave the index by chunk id or with their knowledge base.
pub struct KnowledgeIndexer {
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
}

impl KnowledgeIndexer {
    pub fn new(lexical: Arc<dyn LexicalIndex>, vector: Arc<dyn VectorIndex>) -> Self {
        Self { lexical, vector }
    }

    pub async fn ingest_document(
        &self,
        kb_id: &str,
        doc_id: &str,
        filename: &str,
        generation: &str,
        chunks: &[ChunkRecord],
        vectors: &[Vec<f32>],
    ) -> Result<IngestReport> {
        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let previous = self.vector.fetch_chunks(kb_id, &ids).await?;
        self.vector.upsert(kb_id, doc_id, filename, generation, chunks, vectors).await?;

        if let Err(e) = self.lexical_upsert(kb_id, doc_id, filename, generation, chunks).await {
            warn!(kb_id, doc_id, generation, error = %e, "lexical upsert failed, restoring vector rows");
            if let Err(undo) = self.restore_vectors(kb_id, &ids, previous).await {
                warn!(kb_id, doc_id, error = %undo, "vector compensation failed");
            }
            return Err(e);
        }

        let stale_removed = if doc_id.is_empty() {
            0
        } else {
            self.vector.delete_stale_generation(kb_id, doc_id, &ids).await?
        };
        info!(kb_id, doc_id, generation, chunks = chunks.len(), stale_removed, "document ingested");
        Ok(IngestReport { chunks: chunks.len(), stale_removed })
    }

    /// Undo a vector upsert: drop ids that did not exist before it and
    /// rewrite the rows it replaced.
    async fn restore_vectors(&self, kb_id: &str, ids: &[String], previous: Vec<(ChunkRecord, Vec<f32>)>) -> Result<()> {
        let fresh: Vec<String> = ids
            .iter()
            .filter(|id| !previous.iter().any(|(c, _)| &c.chunk_id == *id))
            .cloned()
            .collect();
        self.vector.delete_chunks(kb_id, &fresh).await?;

        let restored = previous.len();
        let mut groups = RowGroups::new();
        for (chunk, vector) in previous {
            let key = (chunk.doc_id.clone(), chunk.filename.clone(), chunk.ingest_generation.clone(), vector.len());
            let (rows, vectors) = groups.entry(key).or_default();
            rows.push(chunk);
            vectors.push(vector);
        }
        for ((doc, file, tag, _), (rows, vectors)) in groups {
            self.vector.upsert(kb_id, &doc, &file, &tag, &rows, &vectors).await?;
        }
        debug!(kb_id, removed = fresh.len(), restored, "vector rows restored");
        Ok(())
    }

    async fn lexical_upsert(&self, kb_id: &str, doc_id: &str, filename: &str, generation: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let index = self.lexical.clone();
        let (kb, doc, file, tag) = (kb_id.to_string(), doc_id.to_string(), filename.to_string(), generation.to_string());
        let chunks = chunks.to_vec();
        tokio::task::spawn_blocking(move || index.upsert(&kb, &doc, &file, &tag, &chunks))
            .await
            .map_err(|e| Error::Operation(format!("lexical write task failed: {e}")))?
    }

    pub async fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        if doc_id.is_empty() {
            return Err(Error::InvalidInput("doc_id must not be empty".into()));
        }
        self.vector.delete_document(kb_id, doc_id).await?;
        let index = self.lexical.clone();
        let (kb, doc) = (kb_id.to_string(), doc_id.to_string());
        tokio::task::spawn_blocking(move || index.delete_document(&kb, &doc))
            .await
            .map_err(|e| Error::Operation(format!("lexical delete task failed: {e}")))?
    }

    pub async fn delete_collection(&self, kb_id: &str) -> Result<()> {
        self.vector.delete_collection(kb_id).await?;
        let index = self.lexical.clone();
        let kb = kb_id.to_string();
        tokio::task::spawn_blocking(move || index.delete_collection(&kb))
            .await
            .map_err(|e| Error::Operation(format!("lexical delete task failed: {e}")))?
    }

    /// Row counts as `(lexical, vector)`.
    pub async fn counts(&self, kb_id: &str) -> Result<(usize, usize)> {
        let index = self.lexical.clone();
        let kb = kb_id.to_string();
        let lexical = tokio::task::spawn_blocking(move || index.count(&kb))
            .await
            .map_err(|e| Error::Operation(format!("lexical count task failed: {e}")))??;
        Ok((lexical, self.vector.count(kb_id).await?))
    }
}
