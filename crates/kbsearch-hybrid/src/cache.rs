use moka::sync::Cache;
use std::sync::Arc;

use kbsearch_core::error::{Error, Result};
use kbsearch_core::traits::Embedder;

/// Bounded cache of query embeddings keyed by normalized query text and
/// embedder model id.
pub struct QueryCache {
    cache: Cache<(String, String), Arc<Vec<f32>>>,
}

/// Collapse whitespace and lowercase, so trivially different spellings of
/// the same query share an embedding.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

impl QueryCache {
    pub fn new(max_entries: u64) -> Self {
        Self { cache: Cache::builder().max_capacity(max_entries).build() }
    }

    pub fn get(&self, model_id: &str, query: &str) -> Option<Arc<Vec<f32>>> {
        self.cache.get(&(model_id.to_string(), normalize_query(query)))
    }

    /// Cached embedding of `query`, computing and storing it on a miss.
    pub async fn get_or_embed(&self, embedder: &dyn Embedder, query: &str) -> Result<Arc<Vec<f32>>> {
        let key = (embedder.model_id().to_string(), normalize_query(query));
        if let Some(v) = self.cache.get(&key) {
            return Ok(v);
        }
        let mut vectors = embedder.embed(std::slice::from_ref(&key.1)).await?;
        let vector = match vectors.pop() {
            Some(v) if vectors.is_empty() && !v.is_empty() => Arc::new(v),
            _ => return Err(Error::Embedding("embedder returned no vector for the query".into())),
        };
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
