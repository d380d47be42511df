//! The retrieval pipeline: fanout, fuse, dedup, diversity, rerank, reorder.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kbsearch_core::config::EngineSettings;
use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::{Embedder, LexicalIndex, Reranker, VectorIndex};
use kbsearch_core::types::{
    cmp_scored, ChunkRecord, EmptyReason, RetrievalCandidate, RetrievalDiagnostics, RetrievalMode, SourceFailure, SourceKind,
};

use crate::cache::QueryCache;
use crate::dedup::{cap_per_document, dedup};
use crate::fusion::fuse;
use crate::rerank::apply_rerank;
use crate::reorder::reorder;

/// One retrieval request. Unset knobs fall back to the engine's
/// `[retrieval]` settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub kb_ids: Vec<String>,
    /// Knowledge bases currently enabled; `None` treats every requested one as enabled.
    pub enabled_kb_ids: Option<Vec<String>>,
    pub top_k: Option<usize>,
    pub recall_k: Option<usize>,
    pub score_threshold: Option<f64>,
    pub min_term_coverage: Option<f64>,
    pub mode: Option<RetrievalMode>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, kb_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { query: query.into(), kb_ids: kb_ids.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn enabled(mut self, kb_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enabled_kb_ids = Some(kb_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn recall_k(mut self, recall_k: usize) -> Self {
        self.recall_k = Some(recall_k);
        self
    }

    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn min_term_coverage(mut self, coverage: f64) -> Self {
        self.min_term_coverage = Some(coverage);
        self
    }

    pub fn mode(mut self, mode: RetrievalMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOutput {
    pub candidates: Vec<RetrievalCandidate>,
    pub diagnostics: RetrievalDiagnostics,
}

/// A request resolved against the settings and validated.
#[derive(Debug, Clone)]
struct QueryPlan {
    query: String,
    kb_ids: Vec<String>,
    mode: RetrievalMode,
    top_k: usize,
    recall_k: usize,
    threshold: f64,
    min_term_coverage: f64,
}

/// Per-KB result of one source; `None` when the source was not consulted.
type SourceResult = Option<Result<Vec<RetrievalCandidate>>>;

#[derive(Default)]
struct Fanout {
    lexical: Vec<RetrievalCandidate>,
    vector: Vec<RetrievalCandidate>,
    failures: Vec<SourceFailure>,
    attempted: usize,
    lexical_searched: usize,
    vector_searched: usize,
    searched: usize,
}

impl Fanout {
    fn absorb(&mut self, kb_id: &str, source: SourceKind, result: SourceResult) -> bool {
        let Some(result) = result else { return false };
        self.attempted += 1;
        match result {
            Ok(hits) => {
                match source {
                    SourceKind::Lexical => {
                        self.lexical_searched += 1;
                        self.lexical.extend(hits);
                    }
                    SourceKind::Vector => {
                        self.vector_searched += 1;
                        self.vector.extend(hits);
                    }
                }
                true
            }
            Err(e) => {
                warn!(kb_id, %source, error = %e, "source search failed, treating as empty");
                self.failures.push(SourceFailure { kb_id: kb_id.to_string(), source, message: e.to_string() });
                false
            }
        }
    }
}

/// Hybrid retriever over a set of knowledge bases.
///
/// Backends are optional; a request whose mode needs a missing backend is
/// rejected as a configuration error.
pub struct Retriever {
    lexical: Option<Arc<dyn LexicalIndex>>,
    vector: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: EngineSettings,
    cache: QueryCache,
}

impl Retriever {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        settings.validate()?;
        let cache = QueryCache::new(settings.retrieval.query_cache_capacity);
        Ok(Self { lexical: None, vector: None, embedder: None, reranker: None, settings, cache })
    }

    pub fn with_lexical(mut self, index: Arc<dyn LexicalIndex>) -> Self {
        self.lexical = Some(index);
        self
    }

    pub fn with_vector(mut self, index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        self.vector = Some(index);
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.cache
    }

    fn plan(&self, request: &RetrievalRequest) -> Result<QueryPlan> {
        let defaults = &self.settings.retrieval;
        let mode = request.mode.unwrap_or(defaults.mode);
        let top_k = request.top_k.unwrap_or(defaults.top_k);
        if top_k == 0 {
            return Err(Error::InvalidConfig("top_k must be greater than 0".into()));
        }
        let recall_k = match request.recall_k {
            Some(r) if r < top_k => {
                return Err(Error::InvalidConfig(format!("recall_k ({r}) must be >= top_k ({top_k})")));
            }
            Some(r) => r,
            None => defaults.recall_k.unwrap_or(top_k).max(top_k),
        };
        let threshold = request.score_threshold.unwrap_or(defaults.score_threshold);
        let min_term_coverage = request.min_term_coverage.unwrap_or(defaults.min_term_coverage);
        for (name, v) in [("score_threshold", threshold), ("min_term_coverage", min_term_coverage)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidConfig(format!("{name} must be within [0,1], got {v}")));
            }
        }
        if request.kb_ids.is_empty() {
            return Err(Error::InvalidConfig("no knowledge bases requested".into()));
        }
        if mode.uses_lexical() && self.lexical.is_none() {
            return Err(Error::InvalidConfig(format!("mode {mode:?} needs a lexical index, none is configured")));
        }
        if mode.uses_vector() && (self.vector.is_none() || self.embedder.is_none()) {
            return Err(Error::InvalidConfig(format!("mode {mode:?} needs a vector index and an embedder")));
        }
        if request.query.trim().is_empty() {
            return Err(Error::InvalidInput("query must not be empty".into()));
        }

        let mut kb_ids: Vec<String> = Vec::new();
        for kb in &request.kb_ids {
            let enabled = request.enabled_kb_ids.as_ref().map_or(true, |e| e.contains(kb));
            if enabled && !kb_ids.contains(kb) {
                kb_ids.push(kb.clone());
            }
        }
        Ok(QueryPlan { query: request.query.clone(), kb_ids, mode, top_k, recall_k, threshold, min_term_coverage })
    }

    /// Run one request through the pipeline.
    ///
    /// Returns `Err` only for invalid requests and cancellation. Source and
    /// reranker failures degrade the result and are recorded in diagnostics.
    pub async fn retrieve(&self, request: &RetrievalRequest, cancel: &CancellationToken) -> Result<RetrievalOutput> {
        let plan = self.plan(request)?;
        let mut diag = RetrievalDiagnostics {
            effective_top_k: plan.top_k,
            effective_recall_k: plan.recall_k,
            effective_threshold: plan.threshold,
            ..RetrievalDiagnostics::default()
        };
        if plan.kb_ids.is_empty() {
            info!(requested = request.kb_ids.len(), "no enabled knowledge bases to search");
            diag.empty_reason = Some(EmptyReason::NoEnabledKnowledgeBases);
            return Ok(RetrievalOutput { candidates: Vec::new(), diagnostics: diag });
        }

        let fanout = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            f = self.fanout(&plan) => f,
        };
        diag.lexical_candidates = fanout.lexical.len();
        diag.vector_candidates = fanout.vector.len();
        diag.lexical_searched_kb_count = fanout.lexical_searched;
        diag.vector_searched_kb_count = fanout.vector_searched;
        diag.searched_kb_count = fanout.searched;
        let all_failed = fanout.attempted > 0 && fanout.failures.len() == fanout.attempted;
        diag.failed_sources = fanout.failures;

        let mut candidates = fuse(fanout.lexical, fanout.vector, &self.settings.retrieval.fusion);
        diag.fused_count = candidates.len();
        debug!(fused = candidates.len(), "fusion done");

        if plan.threshold > 0.0 {
            candidates.retain(|c| c.best_source_score() >= plan.threshold);
        }
        diag.after_threshold_count = candidates.len();

        candidates = dedup(candidates);
        diag.after_dedup_count = candidates.len();

        candidates = cap_per_document(candidates, self.settings.retrieval.max_per_doc);
        diag.after_diversity_count = candidates.len();
        candidates.truncate(plan.top_k);
        debug!(after_dedup = diag.after_dedup_count, after_diversity = diag.after_diversity_count, kept = candidates.len(), "selection done");

        self.rerank(&plan, &mut candidates, &mut diag, cancel).await?;
        candidates.sort_by(|a, b| cmp_scored(a.final_score, a, b.final_score, b));
        candidates = reorder(candidates, self.settings.retrieval.reorder);

        diag.selected_count = candidates.len();
        if candidates.is_empty() {
            diag.empty_reason = Some(if all_failed {
                EmptyReason::AllSourcesFailed
            } else if diag.fused_count > 0 {
                EmptyReason::BelowThreshold
            } else {
                EmptyReason::NoMatches
            });
        }
        info!(
            kbs = plan.kb_ids.len(),
            mode = ?plan.mode,
            selected = diag.selected_count,
            failed_sources = diag.failed_sources.len(),
            rerank_applied = diag.rerank_applied,
            "retrieval complete"
        );
        Ok(RetrievalOutput { candidates, diagnostics: diag })
    }

    async fn rerank(
        &self,
        plan: &QueryPlan,
        candidates: &mut [RetrievalCandidate],
        diag: &mut RetrievalDiagnostics,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = &self.settings.rerank;
        let Some(reranker) = self.reranker.as_ref().filter(|_| settings.enabled) else {
            return Ok(());
        };
        if candidates.len() < 2 {
            debug!(candidates = candidates.len(), "too few candidates to rerank");
            return Ok(());
        }
        let weight = settings.clamped_weight();
        let timeout = Duration::from_millis(settings.timeout_ms);
        let outcome = apply_rerank(reranker.as_ref(), &plan.query, candidates, weight, timeout, cancel).await?;
        diag.rerank_applied = outcome.applied;
        diag.rerank_weight = outcome.applied.then_some(weight);
        diag.rerank_error = outcome.error;
        Ok(())
    }

    async fn fanout(&self, plan: &QueryPlan) -> Fanout {
        let mut fanout = Fanout::default();

        let mut query_vector = None;
        if plan.mode.uses_vector() {
            if let Some(embedder) = &self.embedder {
                match self.cache.get_or_embed(embedder.as_ref(), &plan.query).await {
                    Ok(v) => query_vector = Some(v),
                    Err(e) => {
                        warn!(error = %e, "query embedding failed, skipping vector search");
                        for kb in &plan.kb_ids {
                            fanout.attempted += 1;
                            fanout.failures.push(SourceFailure {
                                kb_id: kb.clone(),
                                source: SourceKind::Vector,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let searches = plan.kb_ids.iter().map(|kb| self.search_kb(kb.clone(), plan, query_vector.clone()));
        for (kb, lexical, vector) in join_all(searches).await {
            let lex_ok = fanout.absorb(&kb, SourceKind::Lexical, lexical);
            let vec_ok = fanout.absorb(&kb, SourceKind::Vector, vector);
            if lex_ok || vec_ok {
                fanout.searched += 1;
            }
        }
        debug!(
            lexical = fanout.lexical.len(),
            vector = fanout.vector.len(),
            failed = fanout.failures.len(),
            "fanout done"
        );
        fanout
    }

    async fn search_kb(&self, kb_id: String, plan: &QueryPlan, query_vector: Option<Arc<Vec<f32>>>) -> (String, SourceResult, SourceResult) {
        let lexical = async {
            let index = self.lexical.as_ref().filter(|_| plan.mode.uses_lexical())?.clone();
            let (kb, query) = (kb_id.clone(), plan.query.clone());
            let (top_k, coverage) = (plan.recall_k, plan.min_term_coverage);
            let joined = tokio::task::spawn_blocking(move || index.search(&kb, &query, top_k, coverage)).await;
            Some(joined.map_err(|e| Error::Operation(format!("lexical search task failed: {e}"))).and_then(|r| r))
        };
        let vector = async {
            let index = self.vector.as_ref().filter(|_| plan.mode.uses_vector())?;
            let q = query_vector.as_ref()?;
            Some(index.search(&kb_id, q, plan.recall_k).await)
        };
        let (lexical, vector) = tokio::join!(lexical, vector);
        (kb_id, lexical, vector)
    }

    /// Chunks `range` of one document, for neighbour context around a hit.
    pub async fn read_range(&self, kb_id: &str, doc_id: &str, range: RangeInclusive<u32>) -> Result<Vec<ChunkRecord>> {
        if let Some(index) = &self.lexical {
            let index = index.clone();
            let (kb, doc) = (kb_id.to_string(), doc_id.to_string());
            return tokio::task::spawn_blocking(move || index.read_range(&kb, &doc, range))
                .await
                .map_err(|e| Error::Operation(format!("read task failed: {e}")))?;
        }
        match &self.vector {
            Some(index) => index.read_range(kb_id, doc_id, range).await,
            None => Err(Error::InvalidConfig("no index configured".into())),
        }
    }
}
