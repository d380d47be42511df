//! Hybrid retrieval over the lexical and vector indexes.
//!
//! [`Retriever`] answers queries; [`KnowledgeIndexer`] writes document
//! generations to both indexes. [`Engine::open`] wires both from settings.

pub mod cache;
pub mod dedup;
pub mod embed;
pub mod fusion;
pub mod indexer;
pub mod orchestrator;
pub mod reorder;
pub mod rerank;

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use kbsearch_core::config::{resolve_with_base, EngineSettings, VectorBackendKind};
use kbsearch_core::error::Result;
use kbsearch_core::traits::{LexicalIndex, VectorIndex};
use kbsearch_text::TantivyLexicalIndex;
use kbsearch_vector::open_vector_index;

pub use cache::QueryCache;
pub use embed::HttpEmbedder;
pub use indexer::{IngestReport, KnowledgeIndexer};
pub use orchestrator::{RetrievalOutput, RetrievalRequest, Retriever};
pub use rerank::HttpReranker;

pub struct Engine {
    pub retriever: Retriever,
    pub indexer: KnowledgeIndexer,
}

impl Engine {
    /// Open both indexes under `base` and attach the HTTP collaborators the
    /// settings name. Without an embedding endpoint the engine is lexical-only.
    pub async fn open(settings: EngineSettings, base: &Path) -> Result<Self> {
        let lexical_dir = resolve_with_base(base, &settings.storage.lexical_dir);
        let vector_dir = resolve_with_base(base, &settings.storage.vector_dir);
        let lexical: Arc<dyn LexicalIndex> = Arc::new(TantivyLexicalIndex::open(&lexical_dir)?);
        let vector: Arc<dyn VectorIndex> = open_vector_index(&settings.storage, &vector_dir).await?;
        if settings.storage.vector_backend == VectorBackendKind::Memory {
            warn!("memory vector backend: vector rows live only as long as this process");
        }

        let embedder = HttpEmbedder::from_settings(&settings.embedding);
        let reranker = HttpReranker::from_settings(&settings.rerank);
        info!(
            backend = vector.backend_name(),
            embedder = embedder.is_some(),
            reranker = reranker.is_some(),
            "engine opened"
        );

        let indexer = KnowledgeIndexer::new(lexical.clone(), vector.clone());
        let mut retriever = Retriever::new(settings)?.with_lexical(lexical);
        if let Some(e) = embedder {
            retriever = retriever.with_vector(vector, Arc::new(e));
        }
        if let Some(r) = reranker {
            retriever = retriever.with_reranker(Arc::new(r));
        }
        Ok(Self { retriever, indexer })
    }
}
