//! kbsearch-text
//!
//! Tantivy-based lexical index: per-document atomic upserts, BM25 search with
//! min-max normalized scores and term-coverage filtering, read-by-range.

pub mod index;
pub mod search;
pub mod tantivy_utils;

pub use index::TantivyLexicalIndex;
pub use search::{normalize_scores, pool_size, ParsedQuery};
