use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Chunk tables are split by dimensionality: `chunks_d384`, `chunks_d768`, ...
pub const TABLE_PREFIX: &str = "chunks_d";

pub fn table_name(dim: usize) -> String {
	format!("{TABLE_PREFIX}{dim}")
}

/// Dimensionality encoded in a chunk table name, if it is one.
pub fn parse_table_dim(name: &str) -> Option<usize> {
	name.strip_prefix(TABLE_PREFIX)?.parse().ok().filter(|d| *d > 0)
}

pub fn build_arrow_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("kb_id", DataType::Utf8, false),
		Field::new("chunk_id", DataType::Utf8, false),
		Field::new("doc_id", DataType::Utf8, false),
		Field::new("filename", DataType::Utf8, false),
		Field::new("chunk_index", DataType::Int64, false),
		Field::new("content", DataType::Utf8, false),
		Field::new("generation", DataType::Utf8, false),
		Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
	]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn table_names_carry_dimensionality() {
		assert_eq!(table_name(384), "chunks_d384");
		assert_eq!(parse_table_dim("chunks_d768"), Some(768));
		assert_eq!(parse_table_dim("chunks_d0"), None);
		assert_eq!(parse_table_dim("documents"), None);
	}
}
