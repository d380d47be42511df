use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, WhitespaceTokenizer};
use tantivy::Index;

/// Analyzer for the `terms` field. Content is tokenized by the pluggable
/// tokenizer before indexing, so tantivy only needs to split on whitespace.
pub const TERMS_TOKENIZER: &str = "kb_terms";

pub fn build_schema() -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field("kb_id", STRING | STORED);
	schema_builder.add_text_field("doc_key", STRING);
	schema_builder.add_text_field("chunk_key", STRING);
	schema_builder.add_text_field("chunk_id", STORED);
	schema_builder.add_text_field("doc_id", STORED);
	schema_builder.add_text_field("filename", STORED);
	schema_builder.add_u64_field("chunk_index", STORED);
	schema_builder.add_text_field("generation", STORED);
	schema_builder.add_text_field("content", STORED);
	let terms_indexing = TextFieldIndexing::default().set_tokenizer(TERMS_TOKENIZER).set_index_option(IndexRecordOption::WithFreqsAndPositions);
	let terms_options = TextOptions::default().set_indexing_options(terms_indexing).set_stored();
	schema_builder.add_text_field("terms", terms_options);
	schema_builder.build()
}

pub fn register_tokenizer(index: &Index) {
	let tokenizer = TextAnalyzer::builder(WhitespaceTokenizer::default())
		.filter(LowerCaser)
		.build();
	index.tokenizers().register(TERMS_TOKENIZER, tokenizer);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Fields {
	pub kb_id: Field,
	pub doc_key: Field,
	pub chunk_key: Field,
	pub chunk_id: Field,
	pub doc_id: Field,
	pub filename: Field,
	pub chunk_index: Field,
	pub generation: Field,
	pub content: Field,
	pub terms: Field,
}

impl Fields {
	pub(crate) fn from_schema(schema: &Schema) -> tantivy::Result<Self> {
		Ok(Self {
			kb_id: schema.get_field("kb_id")?,
			doc_key: schema.get_field("doc_key")?,
			chunk_key: schema.get_field("chunk_key")?,
			chunk_id: schema.get_field("chunk_id")?,
			doc_id: schema.get_field("doc_id")?,
			filename: schema.get_field("filename")?,
			chunk_index: schema.get_field("chunk_index")?,
			generation: schema.get_field("generation")?,
			content: schema.get_field("content")?,
			terms: schema.get_field("terms")?,
		})
	}
}

/// Unit separator keeps `("a", "b:c")` and `("a:b", "c")` apart.
pub(crate) fn doc_key(kb_id: &str, doc_id: &str) -> String {
	format!("{kb_id}\u{1f}{doc_id}")
}

pub(crate) fn chunk_key(kb_id: &str, chunk_id: &str) -> String {
	format!("{kb_id}\u{1f}{chunk_id}")
}
