use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tantivy::directory::MmapDirectory;
use tantivy::schema::Value;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

use kbsearch_core::error::{Error, Result};
use kbsearch_core::tokenize::{DefaultTokenizer, Tokenizer};
use kbsearch_core::traits::prepare_batch;
use kbsearch_core::types::ChunkRecord;

use crate::tantivy_utils::{build_schema, chunk_key, doc_key, register_tokenizer, Fields};

const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Tantivy-backed lexical index holding every knowledge base of one root.
///
/// A single writer sits behind a mutex, so mutations to the index are
/// serialized; searches go through the reader and never touch that lock.
pub struct TantivyLexicalIndex {
	pub(crate) index: Index,
	pub(crate) reader: IndexReader,
	pub(crate) writer: Mutex<IndexWriter>,
	pub(crate) fields: Fields,
	pub(crate) tokenizer: Arc<dyn Tokenizer>,
}

impl TantivyLexicalIndex {
	/// Open the index under `index_dir`, creating it if missing.
	pub fn open(index_dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(index_dir).map_err(Error::lexical)?;
		let directory = MmapDirectory::open(index_dir).map_err(Error::lexical)?;
		let index = Index::open_or_create(directory, build_schema()).map_err(Error::lexical)?;
		info!(dir = %index_dir.display(), "opened lexical index");
		Self::from_index(index)
	}

	pub fn in_memory() -> Result<Self> {
		Self::from_index(Index::create_in_ram(build_schema()))
	}

	fn from_index(index: Index) -> Result<Self> {
		register_tokenizer(&index);
		let fields = Fields::from_schema(&index.schema()).map_err(Error::lexical)?;
		let writer: IndexWriter = index.writer(WRITER_MEMORY_BUDGET).map_err(Error::lexical)?;
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into().map_err(Error::lexical)?;
		Ok(Self { index, reader, writer: Mutex::new(writer), fields, tokenizer: Arc::new(DefaultTokenizer) })
	}

	/// Swap the tokenizer used for both indexing and queries.
	///
	/// Rows indexed with another tokenizer are not re-tokenized.
	pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
		self.tokenizer = tokenizer;
		self
	}

	pub fn index(&self) -> &Index {
		&self.index
	}

	pub(crate) fn upsert_rows(&self, kb_id: &str, doc_id: &str, filename: &str, generation: &str, chunks: &[ChunkRecord]) -> Result<()> {
		let rows = prepare_batch(kb_id, doc_id, filename, generation, chunks)?;
		let f = self.fields;
		self.write(|writer| {
			// Deletes only hit documents added before them, so the new rows survive.
			if !doc_id.is_empty() {
				writer.delete_term(Term::from_field_text(f.doc_key, &doc_key(kb_id, doc_id)));
			}
			for row in &rows {
				writer.delete_term(Term::from_field_text(f.chunk_key, &chunk_key(kb_id, &row.chunk_id)));
			}
			for row in &rows {
				writer.add_document(self.to_document(row))?;
			}
			Ok(())
		})?;
		info!(kb_id, doc_id, generation, chunks = rows.len(), "lexical upsert committed");
		Ok(())
	}

	pub(crate) fn delete_doc_rows(&self, kb_id: &str, doc_id: &str) -> Result<()> {
		if doc_id.is_empty() {
			return Err(Error::InvalidInput("doc_id must not be empty".into()));
		}
		let f = self.fields;
		self.write(|writer| {
			writer.delete_term(Term::from_field_text(f.doc_key, &doc_key(kb_id, doc_id)));
			Ok(())
		})?;
		info!(kb_id, doc_id, "lexical document deleted");
		Ok(())
	}

	pub(crate) fn delete_kb_rows(&self, kb_id: &str) -> Result<()> {
		let f = self.fields;
		self.write(|writer| {
			writer.delete_term(Term::from_field_text(f.kb_id, kb_id));
			Ok(())
		})?;
		info!(kb_id, "lexical collection deleted");
		Ok(())
	}

	/// Run `ops` and commit them as one unit; roll back on any failure.
	fn write<F>(&self, ops: F) -> Result<()>
	where
		F: FnOnce(&mut IndexWriter) -> tantivy::Result<()>,
	{
		let mut writer = self.writer.lock();
		let outcome = ops(&mut writer).and_then(|()| writer.commit().map(|_| ()));
		if let Err(e) = outcome {
			warn!(error = %e, "lexical write failed, rolling back");
			if let Err(rb) = writer.rollback() {
				warn!(error = %rb, "lexical rollback failed");
			}
			return Err(Error::lexical(e));
		}
		self.reader.reload().map_err(Error::lexical)?;
		debug!("lexical reader reloaded");
		Ok(())
	}

	fn to_document(&self, row: &ChunkRecord) -> TantivyDocument {
		let f = self.fields;
		let terms = self.tokenizer.tokenize(&row.content).join(" ");
		doc!(
			f.kb_id => row.kb_id.clone(),
			f.doc_key => doc_key(&row.kb_id, &row.doc_id),
			f.chunk_key => chunk_key(&row.kb_id, &row.chunk_id),
			f.chunk_id => row.chunk_id.clone(),
			f.doc_id => row.doc_id.clone(),
			f.filename => row.filename.clone(),
			f.chunk_index => u64::from(row.chunk_index),
			f.generation => row.ingest_generation.clone(),
			f.content => row.content.clone(),
			f.terms => terms,
		)
	}

	pub(crate) fn read_chunk(&self, doc: &TantivyDocument) -> ChunkRecord {
		let f = self.fields;
		let text = |field| doc.get_first(field).and_then(|v| v.as_str()).unwrap_or("").to_string();
		let chunk_index = doc.get_first(f.chunk_index).and_then(|v| v.as_u64()).unwrap_or(0);
		ChunkRecord {
			chunk_id: text(f.chunk_id),
			kb_id: text(f.kb_id),
			doc_id: text(f.doc_id),
			filename: text(f.filename),
			chunk_index: u32::try_from(chunk_index).unwrap_or(u32::MAX),
			content: text(f.content),
			ingest_generation: text(f.generation),
		}
	}
}
