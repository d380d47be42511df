use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use std::ops::RangeInclusive;
use tracing::{debug, warn};

use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::VectorIndex;
use kbsearch_core::types::{cmp_scored, ChunkRecord, RetrievalCandidate, SourceKind};

use crate::schema::table_name;
use crate::similarity::{cosine_similarity, is_zero_norm};
use crate::table::{chunk_ids_filter, chunk_tables, collect_rows, doc_filter, kb_filter, open_table};
use crate::writer::LanceVectorIndex;

impl LanceVectorIndex {
	/// Native cosine search; scores are `1 - _distance`.
	async fn search_native(&self, table: &Table, kb_id: &str, query: &[f32], top_k: usize) -> Result<Vec<RetrievalCandidate>> {
		let stream = table
			.vector_search(query.to_vec())
			.map_err(Error::vector)?
			.column("vector")
			.distance_type(DistanceType::Cosine)
			.only_if(kb_filter(kb_id))
			.limit(top_k)
			.execute()
			.await
			.map_err(Error::vector)?;
		let rows = collect_rows(stream).await?;
		Ok(rows
			.into_iter()
			.map(|r| {
				let score = r.distance.map(|d| 1.0 - f64::from(d)).filter(|s| !s.is_nan()).unwrap_or(0.0);
				RetrievalCandidate::from_chunk(&r.chunk, SourceKind::Vector, score)
			})
			.collect())
	}

	/// Full scan of the knowledge base with cosine computed in Rust.
	async fn search_scan(&self, table: &Table, kb_id: &str, query: &[f32]) -> Result<Vec<RetrievalCandidate>> {
		let stream = table.query().only_if(kb_filter(kb_id)).execute().await.map_err(Error::vector)?;
		let rows = collect_rows(stream).await?;
		Ok(rows
			.into_iter()
			.map(|r| {
				let score = cosine_similarity(query, &r.vector);
				RetrievalCandidate::from_chunk(&r.chunk, SourceKind::Vector, score)
			})
			.collect())
	}
}

/// Order by score with the candidate-key tiebreak and keep `top_k`.
pub(crate) fn rank(mut hits: Vec<RetrievalCandidate>, top_k: usize) -> Vec<RetrievalCandidate> {
	hits.sort_by(|a, b| cmp_scored(a.fused_score, a, b.fused_score, b));
	hits.truncate(top_k);
	hits
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
	fn backend_name(&self) -> &'static str {
		"lance"
	}

	async fn upsert(&self, kb_id: &str, doc_id: &str, filename: &str, generation: &str, chunks: &[ChunkRecord], vectors: &[Vec<f32>]) -> Result<()> {
		self.upsert_rows(kb_id, doc_id, filename, generation, chunks, vectors).await
	}

	async fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
		self.delete_doc_rows(kb_id, doc_id).await
	}

	async fn delete_collection(&self, kb_id: &str) -> Result<()> {
		self.delete_kb_rows(kb_id).await
	}

	async fn delete_stale_generation(&self, kb_id: &str, doc_id: &str, keep_chunk_ids: &[String]) -> Result<usize> {
		self.delete_stale_rows(kb_id, doc_id, keep_chunk_ids).await
	}

	async fn delete_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<usize> {
		self.delete_chunk_rows(kb_id, chunk_ids).await
	}

	async fn fetch_chunks(&self, kb_id: &str, chunk_ids: &[String]) -> Result<Vec<(ChunkRecord, Vec<f32>)>> {
		if chunk_ids.is_empty() {
			return Ok(Vec::new());
		}
		let pred = chunk_ids_filter(kb_id, chunk_ids);
		let mut out = Vec::new();
		for (_, name) in chunk_tables(&self.db).await? {
			let t = self.db.open_table(&name).execute().await.map_err(Error::vector)?;
			let stream = t.query().only_if(pred.clone()).execute().await.map_err(Error::vector)?;
			out.extend(collect_rows(stream).await?.into_iter().map(|r| (r.chunk, r.vector)));
		}
		Ok(out)
	}

	async fn search(&self, kb_id: &str, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievalCandidate>> {
		if top_k == 0 || query_vector.is_empty() {
			return Ok(Vec::new());
		}
		let Some(table) = open_table(&self.db, &table_name(query_vector.len())).await? else {
			debug!(kb_id, dim = query_vector.len(), "no vectors of this dimensionality");
			return Ok(Vec::new());
		};
		if self.accelerated && !is_zero_norm(query_vector) {
			match self.search_native(&table, kb_id, query_vector, top_k).await {
				Ok(hits) => return Ok(rank(hits, top_k)),
				Err(e) => warn!(kb_id, error = %e, "native vector search failed, scanning in software"),
			}
		}
		let hits = self.search_scan(&table, kb_id, query_vector).await?;
		Ok(rank(hits, top_k))
	}

	async fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>> {
		let pred = format!(
			"{} AND chunk_index >= {} AND chunk_index <= {}",
			doc_filter(kb_id, doc_id),
			range.start(),
			range.end()
		);
		let mut chunks = Vec::new();
		for (_, name) in chunk_tables(&self.db).await? {
			let t = self.db.open_table(&name).execute().await.map_err(Error::vector)?;
			let stream = t.query().only_if(pred.clone()).execute().await.map_err(Error::vector)?;
			chunks.extend(collect_rows(stream).await?.into_iter().map(|r| r.chunk));
		}
		chunks.sort_by(|a, b| a.chunk_index.cmp(&b.chunk_index).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
		Ok(chunks)
	}

	async fn count(&self, kb_id: &str) -> Result<usize> {
		let mut n = 0usize;
		for (_, name) in chunk_tables(&self.db).await? {
			let t = self.db.open_table(&name).execute().await.map_err(Error::vector)?;
			n += t.count_rows(Some(kb_filter(kb_id))).await.map_err(Error::vector)?;
		}
		Ok(n)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use tempfile::TempDir;

	fn chunk(id: &str, index: u32) -> ChunkRecord {
		ChunkRecord {
			chunk_id: id.into(),
			kb_id: String::new(),
			doc_id: String::new(),
			filename: String::new(),
			chunk_index: index,
			content: format!("chunk {id}"),
			ingest_generation: String::new(),
		}
	}

	#[tokio::test]
	async fn native_search_scores_match_software_scan() {
		let tmp = TempDir::new().expect("tempdir");
		let idx = LanceVectorIndex::open(tmp.path()).await.expect("open");
		let chunks = [chunk("a", 0), chunk("b", 1), chunk("c", 2), chunk("d", 3)];
		let vectors = vec![
			vec![1.0, 0.0, 0.0],
			vec![0.6, 0.8, 0.0],
			vec![0.0, 0.0, 2.0],
			vec![-1.0, 0.5, 0.5],
		];
		idx.upsert("kb", "doc", "doc.txt", "g1", &chunks, &vectors).await.expect("upsert");
		idx.upsert("other", "doc", "doc.txt", "g1", &[chunk("z", 0)], &[vec![1.0, 0.0, 0.0]]).await.expect("upsert other");
		let table = open_table(&idx.db, &table_name(3)).await.expect("open table").expect("table exists");

		let query = [0.9, 0.3, 0.1];
		let native = idx.search_native(&table, "kb", &query, 10).await.expect("native search runs");
		let scanned = idx.search_scan(&table, "kb", &query).await.expect("scan");
		assert_eq!(native.len(), 4);
		assert_eq!(scanned.len(), 4);
		assert!(native.iter().all(|c| c.kb_id == "kb"));

		let expected: HashMap<&str, f64> = scanned.iter().map(|c| (c.chunk_id.as_str(), c.fused_score)).collect();
		for hit in &native {
			let want = expected[hit.chunk_id.as_str()];
			assert!((hit.fused_score - want).abs() < 1e-4, "{}: native {} vs scan {want}", hit.chunk_id, hit.fused_score);
		}
		let order = |hits: Vec<RetrievalCandidate>| rank(hits, 4).into_iter().map(|c| c.chunk_id).collect::<Vec<_>>();
		assert_eq!(order(native), order(scanned));
	}
}
