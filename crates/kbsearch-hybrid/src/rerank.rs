//! Cross-encoder reranking and blending of reranker scores into the ranking.
//!
//! The HTTP client talks to an OpenAI-compatible `/v1/rerank` endpoint. A
//! reranker that errors, times out or returns nothing usable never fails the
//! request: the fused ordering stands and the failure is reported.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kbsearch_core::config::RerankSettings;
use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::Reranker;
use kbsearch_core::types::RetrievalCandidate;

pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpReranker {
    pub fn new(base_url: &str, model: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v1/rerank", base_url.trim_end_matches('/')),
            model: model.unwrap_or("default").to_string(),
        }
    }

    /// A client for the configured endpoint, when reranking is enabled and has one.
    pub fn from_settings(settings: &RerankSettings) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        settings.base_url.as_deref().map(|url| Self::new(url, settings.model.as_deref()))
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f64,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<HashMap<usize, f64>> {
        let body = RerankRequest { model: &self.model, query, documents, top_n: documents.len() };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rerank(format!("failed to reach reranker: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Rerank(format!("reranker returned {status}: {text}")));
        }
        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| Error::Rerank(format!("failed to parse reranker response: {e}")))?;
        Ok(parsed.results.into_iter().map(|r| (r.index, r.relevance_score)).collect())
    }
}

/// What happened when blending reranker scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOutcome {
    pub applied: bool,
    pub error: Option<String>,
}

/// Min-max normalize when any finite score falls outside `[0,1]`.
/// Non-finite scores are dropped.
pub fn normalize_rerank_scores(scores: HashMap<usize, f64>) -> HashMap<usize, f64> {
    let finite: HashMap<usize, f64> = scores.into_iter().filter(|(_, s)| s.is_finite()).collect();
    if finite.values().all(|s| (0.0..=1.0).contains(s)) {
        return finite;
    }
    let min = finite.values().copied().fold(f64::INFINITY, f64::min);
    let max = finite.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    finite
        .into_iter()
        .map(|(i, s)| (i, if span > f64::EPSILON { (s - min) / span } else { 1.0 }))
        .collect()
}

/// Score `candidates` with `reranker` and blend: `w * rerank + (1 - w) * fused`.
///
/// Candidates the reranker did not score count as 0. On any failure
/// `final_score` stays equal to `fused_score`. Only cancellation is an error.
pub async fn apply_rerank(
    reranker: &dyn Reranker,
    query: &str,
    candidates: &mut [RetrievalCandidate],
    weight: f64,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<RerankOutcome> {
    let documents: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
    let call = tokio::time::timeout(timeout, reranker.rerank(query, &documents));
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = call => r,
    };
    let scores = match outcome {
        Err(_) => Err(format!("reranker timed out after {} ms", timeout.as_millis())),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(scores)) => {
            let scores = normalize_rerank_scores(scores);
            if scores.is_empty() {
                Err("reranker returned no usable scores".to_string())
            } else {
                Ok(scores)
            }
        }
    };
    let scores = match scores {
        Ok(s) => s,
        Err(message) => {
            warn!(error = %message, candidates = candidates.len(), "rerank failed, keeping fused order");
            for c in candidates.iter_mut() {
                c.rerank_score = None;
                c.final_score = c.fused_score;
            }
            return Ok(RerankOutcome { applied: false, error: Some(message) });
        }
    };

    let w = weight.clamp(0.0, 1.0);
    for (i, c) in candidates.iter_mut().enumerate() {
        let r = scores.get(&i).copied().unwrap_or(0.0);
        c.rerank_score = Some(r);
        c.final_score = w * r + (1.0 - w) * c.fused_score;
    }
    debug!(scored = scores.len(), candidates = candidates.len(), weight = w, "rerank blended");
    Ok(RerankOutcome { applied: true, error: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_scores_are_left_alone() {
        let s = normalize_rerank_scores(HashMap::from([(0, 0.2), (1, 0.9)]));
        assert_eq!(s[&0], 0.2);
        assert_eq!(s[&1], 0.9);
    }

    #[test]
    fn logits_are_min_max_normalized() {
        let s = normalize_rerank_scores(HashMap::from([(0, -2.0), (1, 6.0), (2, 2.0), (3, f64::NAN)]));
        assert_eq!(s.len(), 3);
        assert_eq!(s[&0], 0.0);
        assert_eq!(s[&1], 1.0);
        assert_eq!(s[&2], 0.5);
    }

    #[test]
    fn disabled_settings_build_no_client() {
        assert!(HttpReranker::from_settings(&RerankSettings::default()).is_none());
        let on = RerankSettings { enabled: true, base_url: Some("http://localhost:8080/".into()), ..RerankSettings::default() };
        let client = HttpReranker::from_settings(&on).expect("client");
        assert_eq!(client.url, "http://localhost:8080/v1/rerank");
    }
}
