use lancedb::Connection;
use arrow_array::RecordBatchIterator;
use std::path::Path;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::prepare_batch;
use kbsearch_core::types::ChunkRecord;

use crate::locks::DocLocks;
use crate::schema::table_name;
use crate::table::{chunk_ids_filter, chunk_tables, doc_filter, ensure_table, kb_filter, open_db, sql_in_list, to_record_batch};

/// Vector index over LanceDB, one table per vector dimensionality.
///
/// Rows are keyed by `(kb_id, chunk_id)`. Writers to the same document are
/// serialized through [`DocLocks`]; readers never wait on them.
pub struct LanceVectorIndex {
    pub(crate) db: Connection,
    pub(crate) accelerated: bool,
    pub(crate) locks: DocLocks,
    create_lock: AsyncMutex<()>,
}

impl LanceVectorIndex {
    pub async fn open(db_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_path).map_err(Error::vector)?;
        let db = open_db(db_path.to_string_lossy().as_ref()).await?;
        info!(dir = %db_path.display(), "opened vector index");
        Ok(Self { db, accelerated: true, locks: DocLocks::default(), create_lock: AsyncMutex::new(()) })
    }

    /// Toggle LanceDB's native cosine search. When off, or when it fails,
    /// search scans the table and scores in software.
    pub fn with_accelerated(mut self, accelerated: bool) -> Self {
        self.accelerated = accelerated;
        self
    }

    pub fn accelerated(&self) -> bool {
        self.accelerated
    }

    pub(crate) async fn upsert_rows(
        &self,
        kb_id: &str,
        doc_id: &str,
        filename: &str,
        generation: &str,
        chunks: &[ChunkRecord],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(Error::InvalidInput(format!("{} chunks but {} vectors", chunks.len(), vectors.len())));
        }
        let rows = prepare_batch(kb_id, doc_id, filename, generation, chunks)?;
        if rows.is_empty() {
            return Ok(());
        }
        let dim = vectors[0].len();
        if dim == 0 {
            return Err(Error::InvalidInput("vectors must not be empty".into()));
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::InvalidInput(format!("mixed dimensionality in one upsert: {dim} and {}", v.len())));
        }

        let _guard = self.locks.lock(kb_id, doc_id).await;
        let name = table_name(dim);
        let table = {
            let _create = self.create_lock.lock().await;
            ensure_table(&self.db, &name, dim).await?
        };
        let batch = to_record_batch(&rows, vectors, dim)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
        let mut mi = table.merge_insert(&["kb_id", "chunk_id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        mi.execute(reader).await.map_err(Error::vector)?;

        // A chunk re-embedded at another dimensionality must not linger in its old table.
        let ids: Vec<String> = rows.iter().map(|r| r.chunk_id.clone()).collect();
        let pred = chunk_ids_filter(kb_id, &ids);
        for (other_dim, other) in chunk_tables(&self.db).await? {
            if other_dim == dim {
                continue;
            }
            let t = self.db.open_table(&other).execute().await.map_err(Error::vector)?;
            t.delete(&pred).await.map_err(Error::vector)?;
        }
        info!(kb_id, doc_id, generation, dim, chunks = rows.len(), "vector upsert committed");
        Ok(())
    }

    pub(crate) async fn delete_doc_rows(&self, kb_id: &str, doc_id: &str) -> Result<()> {
        if doc_id.is_empty() {
            return Err(Error::InvalidInput("doc_id must not be empty".into()));
        }
        let _guard = self.locks.lock(kb_id, doc_id).await;
        let deleted = self.delete_where(&doc_filter(kb_id, doc_id)).await?;
        info!(kb_id, doc_id, deleted, "vector document deleted");
        Ok(())
    }

    pub(crate) async fn delete_kb_rows(&self, kb_id: &str) -> Result<()> {
        let deleted = self.delete_where(&kb_filter(kb_id)).await?;
        info!(kb_id, deleted, "vector collection deleted");
        Ok(())
    }

    pub(crate) async fn delete_stale_rows(&self, kb_id: &str, doc_id: &str, keep: &[String]) -> Result<usize> {
        if doc_id.is_empty() {
            debug!(kb_id, "chunks without a document are not swept");
            return Ok(0);
        }
        let _guard = self.locks.lock(kb_id, doc_id).await;
        let mut pred = doc_filter(kb_id, doc_id);
        if !keep.is_empty() {
            pred.push_str(&format!(" AND chunk_id NOT IN ({})", sql_in_list(keep)));
        }
        let deleted = self.delete_where(&pred).await?;
        debug!(kb_id, doc_id, kept = keep.len(), deleted, "stale vector rows removed");
        Ok(deleted)
    }

    pub(crate) async fn delete_chunk_rows(&self, kb_id: &str, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.delete_where(&chunk_ids_filter(kb_id, chunk_ids)).await?;
        debug!(kb_id, requested = chunk_ids.len(), deleted, "vector chunks removed");
        Ok(deleted)
    }

    /// Delete rows matching `pred` from every chunk table; returns how many went.
    async fn delete_where(&self, pred: &str) -> Result<usize> {
        let mut deleted = 0usize;
        for (_, name) in chunk_tables(&self.db).await? {
            let t = self.db.open_table(&name).execute().await.map_err(Error::vector)?;
            let before = t.count_rows(Some(pred.to_string())).await.map_err(Error::vector)?;
            if before == 0 {
                continue;
            }
            t.delete(pred).await.map_err(Error::vector)?;
            deleted += before;
        }
        Ok(deleted)
    }
}
