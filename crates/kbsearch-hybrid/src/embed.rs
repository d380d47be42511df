use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use kbsearch_core::config::EmbeddingSettings;
use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::Embedder;

/// Embedder backed by an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Option<Self> {
        settings
            .base_url
            .as_deref()
            .map(|url| Self::new(url, &settings.model, Duration::from_millis(settings.timeout_ms)))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&EmbedRequest { model: &self.model, input: texts })
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("failed to reach embedder: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("embedder returned {status}: {body}")));
        }
        let mut parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("failed to parse embedder response: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(Error::Embedding(format!("asked for {} embeddings, got {}", texts.len(), parsed.data.len())));
        }
        // Servers may answer out of order; `index` restores input order.
        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        debug!(model = %self.model, count = texts.len(), "embedded texts");
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
