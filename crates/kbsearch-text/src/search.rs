use std::collections::HashSet;
use std::ops::RangeInclusive;
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::query::{BooleanQuery, BoostQuery, ConstScoreQuery, Occur, PhraseQuery, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::{TantivyDocument, Term};
use tracing::debug;

use kbsearch_core::error::{Error, Result};
use kbsearch_core::tokenize::{significant_terms, term_coverage};
use kbsearch_core::traits::LexicalIndex;
use kbsearch_core::types::{cmp_scored, ChunkRecord, RetrievalCandidate, SourceKind};

use crate::index::TantivyLexicalIndex;
use crate::tantivy_utils::doc_key;

/// Upper bound on the internal candidate pool, whatever `top_k` asks for.
pub const MAX_POOL: usize = 1000;
const POOL_FACTOR: usize = 5;
const PHRASE_BOOST: f32 = 2.0;

/// Candidates fetched before coverage filtering so the filter has room to work.
pub fn pool_size(top_k: usize) -> usize {
	top_k.saturating_mul(POOL_FACTOR).min(MAX_POOL).max(top_k)
}

/// A lexical query after tokenization.
///
/// Every token counts as a term; segments wrapped in double quotes also
/// contribute a phrase clause when they hold at least two tokens.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedQuery {
	pub terms: Vec<String>,
	pub phrases: Vec<Vec<String>>,
}

impl TantivyLexicalIndex {
	pub fn parse_query(&self, query: &str) -> ParsedQuery {
		let mut parsed = ParsedQuery::default();
		for (i, segment) in query.split('"').enumerate() {
			let tokens = self.tokenizer.tokenize(segment);
			if i % 2 == 1 && tokens.len() >= 2 {
				parsed.phrases.push(tokens.clone());
			}
			parsed.terms.extend(tokens);
		}
		parsed
	}

	fn build_query(&self, kb_id: &str, parsed: &ParsedQuery) -> BooleanQuery {
		let f = self.fields;
		let mut seen = HashSet::new();
		let mut clauses: Vec<(Occur, Box<dyn Query>)> = parsed
			.terms
			.iter()
			.filter(|t| seen.insert(t.as_str()))
			.map(|t| {
				let q: Box<dyn Query> = Box::new(TermQuery::new(Term::from_field_text(f.terms, t), IndexRecordOption::WithFreqs));
				(Occur::Should, q)
			})
			.collect();
		for phrase in &parsed.phrases {
			let terms: Vec<Term> = phrase.iter().map(|t| Term::from_field_text(f.terms, t)).collect();
			let q: Box<dyn Query> = Box::new(BoostQuery::new(Box::new(PhraseQuery::new(terms)), PHRASE_BOOST));
			clauses.push((Occur::Should, q));
		}
		// Zero-scored filter so the kb clause never shifts BM25 scores.
		let kb_filter: Box<dyn Query> = Box::new(ConstScoreQuery::new(Box::new(self.kb_query(kb_id)), 0.0));
		let text: Box<dyn Query> = Box::new(BooleanQuery::new(clauses));
		BooleanQuery::new(vec![(Occur::Must, kb_filter), (Occur::Must, text)])
	}

	fn kb_query(&self, kb_id: &str) -> TermQuery {
		TermQuery::new(Term::from_field_text(self.fields.kb_id, kb_id), IndexRecordOption::Basic)
	}
}

struct PoolHit {
	chunk: ChunkRecord,
	raw: f64,
	coverage: f64,
}

/// Min-max normalize raw scores into `[0,1]`; a flat pool maps to 1.0.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
	let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
	let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
	let span = max - min;
	raw.iter()
		.map(|&s| if span > f64::EPSILON { (s - min) / span } else { 1.0 })
		.collect()
}

impl LexicalIndex for TantivyLexicalIndex {
	fn upsert(&self, kb_id: &str, doc_id: &str, filename: &str, generation: &str, chunks: &[ChunkRecord]) -> Result<()> {
		self.upsert_rows(kb_id, doc_id, filename, generation, chunks)
	}

	fn delete_document(&self, kb_id: &str, doc_id: &str) -> Result<()> {
		self.delete_doc_rows(kb_id, doc_id)
	}

	fn delete_collection(&self, kb_id: &str) -> Result<()> {
		self.delete_kb_rows(kb_id)
	}

	fn search(&self, kb_id: &str, query: &str, top_k: usize, min_term_coverage: f64) -> Result<Vec<RetrievalCandidate>> {
		if !min_term_coverage.is_finite() || !(0.0..=1.0).contains(&min_term_coverage) {
			return Err(Error::InvalidInput(format!("min_term_coverage must be within [0,1], got {min_term_coverage}")));
		}
		if top_k == 0 {
			return Ok(Vec::new());
		}
		let parsed = self.parse_query(query);
		if parsed.terms.is_empty() {
			debug!(kb_id, "lexical query has no searchable terms");
			return Ok(Vec::new());
		}
		let significant = significant_terms(&parsed.terms);
		let pool = pool_size(top_k);
		let searcher = self.reader.searcher();
		let top_docs = searcher.search(&self.build_query(kb_id, &parsed), &TopDocs::with_limit(pool)).map_err(Error::lexical)?;

		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr).map_err(Error::lexical)?;
			let terms_text = doc.get_first(self.fields.terms).and_then(|v| v.as_str()).unwrap_or("");
			let token_set: HashSet<&str> = terms_text.split_whitespace().collect();
			let coverage = term_coverage(&significant, &token_set);
			hits.push(PoolHit { chunk: self.read_chunk(&doc), raw: f64::from(score), coverage });
		}
		let pooled = hits.len();
		let raw: Vec<f64> = hits.iter().map(|h| h.raw).collect();
		let normalized = normalize_scores(&raw);

		let mut out: Vec<RetrievalCandidate> = hits
			.into_iter()
			.zip(normalized)
			.filter(|(h, _)| min_term_coverage <= 0.0 || h.coverage + 1e-12 >= min_term_coverage)
			.map(|(h, score)| RetrievalCandidate::from_chunk(&h.chunk, SourceKind::Lexical, score))
			.collect();
		out.sort_by(|a, b| cmp_scored(a.fused_score, a, b.fused_score, b));
		out.truncate(top_k);
		debug!(kb_id, pooled, kept = out.len(), min_term_coverage, "lexical search");
		Ok(out)
	}

	fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>> {
		let searcher = self.reader.searcher();
		let q = TermQuery::new(Term::from_field_text(self.fields.doc_key, &doc_key(kb_id, doc_id)), IndexRecordOption::Basic);
		let addrs = searcher.search(&q, &DocSetCollector).map_err(Error::lexical)?;
		let mut chunks = Vec::new();
		for addr in addrs {
			let doc: TantivyDocument = searcher.doc(addr).map_err(Error::lexical)?;
			let chunk = self.read_chunk(&doc);
			if range.contains(&chunk.chunk_index) {
				chunks.push(chunk);
			}
		}
		chunks.sort_by(|a, b| a.chunk_index.cmp(&b.chunk_index).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
		Ok(chunks)
	}

	fn count(&self, kb_id: &str) -> Result<usize> {
		self.reader.searcher().search(&self.kb_query(kb_id), &Count).map_err(Error::lexical)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pool_is_wider_than_top_k_but_capped() {
		assert_eq!(pool_size(4), 20);
		assert_eq!(pool_size(500), MAX_POOL);
		assert_eq!(pool_size(2000), 2000);
	}

	#[test]
	fn normalization_spans_unit_interval() {
		let n = normalize_scores(&[2.0, 4.0, 3.0]);
		assert_eq!(n, vec![0.0, 1.0, 0.5]);
		assert_eq!(normalize_scores(&[1.3, 1.3]), vec![1.0, 1.0]);
	}

	#[test]
	fn quoted_segments_become_phrases() {
		let idx = TantivyLexicalIndex::in_memory().expect("index");
		let parsed = idx.parse_query(r#"need "manager approval" now "x""#);
		assert_eq!(parsed.terms, vec!["need", "manager", "approval", "now", "x"]);
		assert_eq!(parsed.phrases, vec![vec!["manager".to_string(), "approval".to_string()]]);
	}
}
