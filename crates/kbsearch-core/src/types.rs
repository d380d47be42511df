//! Domain types shared by the lexical index, the vector index and the
//! retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub type ChunkId = String;

/// A chunk of a source document that is independently indexed.
///
/// - `chunk_id`: unique within `kb_id`
/// - `doc_id`: stable document identity; may be empty for orphaned chunks
/// - `filename`: display name of the source document
/// - `chunk_index`: position within the parent document
/// - `ingest_generation`: opaque tag of the ingestion batch that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub kb_id: String,
    pub doc_id: String,
    pub filename: String,
    pub chunk_index: u32,
    pub content: String,
    pub ingest_generation: String,
}

/// Indicates which index produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Lexical,
    Vector,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lexical => f.write_str("lexical"),
            Self::Vector => f.write_str("vector"),
        }
    }
}

/// Which indexes a request fans out to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Lexical,
    Vector,
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub fn uses_lexical(self) -> bool {
        matches!(self, Self::Lexical | Self::Hybrid)
    }

    pub fn uses_vector(self) -> bool {
        matches!(self, Self::Vector | Self::Hybrid)
    }
}

impl FromStr for RetrievalMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" | "text" | "bm25" => Ok(Self::Lexical),
            "vector" | "dense" => Ok(Self::Vector),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(crate::error::Error::InvalidConfig(format!(
                "unsupported retrieval mode '{other}'"
            ))),
        }
    }
}

/// Document half of the candidate identity key.
///
/// Chunks without a `doc_id` fall back to the filename, and chunks with
/// neither fall back to a hash of their content so identical orphans merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocIdentity {
    Doc(String),
    File(String),
    Content(String),
}

impl DocIdentity {
    pub fn of(doc_id: &str, filename: &str, content: &str) -> Self {
        if !doc_id.is_empty() {
            Self::Doc(doc_id.to_string())
        } else if !filename.is_empty() {
            Self::File(filename.to_string())
        } else {
            Self::Content(content_hash(content))
        }
    }
}

/// Identity used to merge the same passage across sources and generations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidateKey {
    pub kb_id: String,
    pub doc: DocIdentity,
    pub chunk_index: u32,
}

/// Hex blake3 digest of chunk content.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// One result flowing through the retrieval pipeline.
///
/// Source scores are normalized to `[0,1]`. `final_score` starts out equal to
/// `fused_score` and only diverges when a reranker score is blended in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: ChunkId,
    pub kb_id: String,
    pub doc_id: String,
    pub filename: String,
    pub chunk_index: u32,
    pub content: String,
    pub lexical_score: Option<f64>,
    pub vector_score: Option<f64>,
    pub fused_score: f64,
    pub rerank_score: Option<f64>,
    pub final_score: f64,
}

impl RetrievalCandidate {
    /// Candidate carrying a single source score.
    pub fn from_chunk(chunk: &ChunkRecord, source: SourceKind, score: f64) -> Self {
        let (lexical_score, vector_score) = match source {
            SourceKind::Lexical => (Some(score), None),
            SourceKind::Vector => (None, Some(score)),
        };
        Self {
            chunk_id: chunk.chunk_id.clone(),
            kb_id: chunk.kb_id.clone(),
            doc_id: chunk.doc_id.clone(),
            filename: chunk.filename.clone(),
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
            lexical_score,
            vector_score,
            fused_score: score,
            rerank_score: None,
            final_score: score,
        }
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            kb_id: self.kb_id.clone(),
            doc: self.doc_identity(),
            chunk_index: self.chunk_index,
        }
    }

    pub fn doc_identity(&self) -> DocIdentity {
        DocIdentity::of(&self.doc_id, &self.filename, &self.content)
    }

    /// Score reported by the given source, if the candidate came from it.
    pub fn source_score(&self, source: SourceKind) -> Option<f64> {
        match source {
            SourceKind::Lexical => self.lexical_score,
            SourceKind::Vector => self.vector_score,
        }
    }

    /// Best normalized score across the sources that returned this candidate.
    pub fn best_source_score(&self) -> f64 {
        self.lexical_score
            .into_iter()
            .chain(self.vector_score)
            .fold(0.0, f64::max)
    }
}

/// Descending by `score`, then ascending by identity key, then chunk id.
pub fn cmp_scored(a_score: f64, a: &RetrievalCandidate, b_score: f64, b: &RetrievalCandidate) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.key().cmp(&b.key()))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Why a successful request returned nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    NoEnabledKnowledgeBases,
    AllSourcesFailed,
    BelowThreshold,
    NoMatches,
}

/// A source search that failed and was treated as returning nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub kb_id: String,
    pub source: SourceKind,
    pub message: String,
}

/// Per-request observability record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
    pub fused_count: usize,
    pub after_threshold_count: usize,
    pub after_dedup_count: usize,
    pub after_diversity_count: usize,
    pub selected_count: usize,
    pub effective_top_k: usize,
    pub effective_recall_k: usize,
    pub effective_threshold: f64,
    pub lexical_searched_kb_count: usize,
    pub vector_searched_kb_count: usize,
    pub searched_kb_count: usize,
    pub failed_sources: Vec<SourceFailure>,
    pub rerank_applied: bool,
    pub rerank_weight: Option<f64>,
    pub rerank_error: Option<String>,
    pub empty_reason: Option<EmptyReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: &str, filename: &str, content: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: "c".into(),
            kb_id: "kb".into(),
            doc_id: doc_id.into(),
            filename: filename.into(),
            chunk_index: 3,
            content: content.into(),
            ingest_generation: "g1".into(),
        }
    }

    #[test]
    fn doc_identity_falls_back_to_filename_then_content() {
        assert_eq!(DocIdentity::of("d1", "a.txt", "x"), DocIdentity::Doc("d1".into()));
        assert_eq!(DocIdentity::of("", "a.txt", "x"), DocIdentity::File("a.txt".into()));
        assert_eq!(DocIdentity::of("", "", "x"), DocIdentity::Content(content_hash("x")));
    }

    #[test]
    fn orphaned_chunks_with_same_content_share_a_key() {
        let a = RetrievalCandidate::from_chunk(&chunk("", "", "same text"), SourceKind::Lexical, 0.4);
        let mut b = RetrievalCandidate::from_chunk(&chunk("", "", "same text"), SourceKind::Vector, 0.9);
        b.chunk_id = "other".into();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn best_source_score_takes_max() {
        let mut c = RetrievalCandidate::from_chunk(&chunk("d", "f", "t"), SourceKind::Lexical, 0.3);
        c.vector_score = Some(0.7);
        assert!((c.best_source_score() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn mode_parses_known_names() {
        assert_eq!("HYBRID".parse::<RetrievalMode>().ok(), Some(RetrievalMode::Hybrid));
        assert_eq!("bm25".parse::<RetrievalMode>().ok(), Some(RetrievalMode::Lexical));
        assert!("graph".parse::<RetrievalMode>().is_err());
    }
}
