//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` +
//! `config.<env>.toml` + `KBSEARCH_*` env vars (nested keys split on `__`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::types::RetrievalMode;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(EngineSettings::default()))
            .merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("KBSEARCH_").split("__"));

        let config = Self { figment };
        config.settings()?;
        Ok(config)
    }

    /// Defaults overlaid with a single TOML file; no environment lookup.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(EngineSettings::default())).merge(Toml::file(path));
        let config = Self { figment };
        config.settings()?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// The full typed settings tree, validated.
    pub fn settings(&self) -> anyhow::Result<EngineSettings> {
        let settings: EngineSettings = self
            .figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to read settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub storage: StorageSettings,
    pub retrieval: RetrievalSettings,
    pub rerank: RerankSettings,
    pub embedding: EmbeddingSettings,
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), Error> {
        self.retrieval.validate()?;
        self.rerank.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackendKind {
    /// LanceDB tables with native cosine search and a software-scan fallback.
    #[default]
    Lance,
    /// Process-local packed vectors, software scan only. Nothing is persisted.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub lexical_dir: String,
    pub vector_dir: String,
    pub vector_backend: VectorBackendKind,
    /// Use the backend's native similarity operator when it has one.
    pub accelerated: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            lexical_dir: "./data/indexes/lexical".to_string(),
            vector_dir: "./data/indexes/vector".to_string(),
            vector_backend: VectorBackendKind::Lance,
            accelerated: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// `vector_weight * vector_score + lexical_weight * lexical_score`.
    Weighted,
    /// Reciprocal rank fusion, `sum 1 / (k + rank)`.
    #[default]
    Rrf,
}

/// How weighted fusion scores a candidate that only one source returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleSourceScoring {
    /// Own score times own weight; the missing side contributes zero.
    #[default]
    Weighted,
    /// Own score alone, as if the present side carried the full weight.
    Renormalized,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderStrategy {
    #[default]
    None,
    /// Best items at both ends of the list, weakest in the middle.
    LongContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    pub strategy: FusionStrategy,
    pub vector_weight: f64,
    pub lexical_weight: f64,
    pub single_source: SingleSourceScoring,
    pub rrf_k: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Rrf,
            vector_weight: 0.7,
            lexical_weight: 0.3,
            single_source: SingleSourceScoring::Weighted,
            rrf_k: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub mode: RetrievalMode,
    pub top_k: usize,
    /// Candidates fetched per source and knowledge base; `None` means `top_k`.
    pub recall_k: Option<usize>,
    pub score_threshold: f64,
    pub min_term_coverage: f64,
    pub fusion: FusionSettings,
    /// At most this many results per source document; 0 disables the cap.
    pub max_per_doc: usize,
    pub reorder: ReorderStrategy,
    pub query_cache_capacity: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: 5,
            recall_k: None,
            score_threshold: 0.0,
            min_term_coverage: 0.0,
            fusion: FusionSettings::default(),
            max_per_doc: 0,
            reorder: ReorderStrategy::None,
            query_cache_capacity: 1024,
        }
    }
}

impl RetrievalSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.top_k == 0 {
            return Err(Error::InvalidConfig("retrieval.top_k must be greater than 0".into()));
        }
        if let Some(recall_k) = self.recall_k {
            if recall_k < self.top_k {
                return Err(Error::InvalidConfig(format!(
                    "retrieval.recall_k ({recall_k}) must be >= top_k ({})",
                    self.top_k
                )));
            }
        }
        check_unit("retrieval.score_threshold", self.score_threshold)?;
        check_unit("retrieval.min_term_coverage", self.min_term_coverage)?;
        let f = &self.fusion;
        for (name, w) in [("fusion.vector_weight", f.vector_weight), ("fusion.lexical_weight", f.lexical_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidConfig(format!("{name} must be a non-negative number, got {w}")));
            }
        }
        if f.strategy == FusionStrategy::Weighted && f.vector_weight + f.lexical_weight <= 0.0 {
            return Err(Error::InvalidConfig("fusion weights must not both be zero".into()));
        }
        if !f.rrf_k.is_finite() || f.rrf_k < 0.0 {
            return Err(Error::InvalidConfig(format!("fusion.rrf_k must be >= 0, got {}", f.rrf_k)));
        }
        Ok(())
    }

    pub fn effective_recall_k(&self) -> usize {
        self.recall_k.unwrap_or(self.top_k).max(self.top_k)
    }
}

fn check_unit(name: &str, v: f64) -> Result<(), Error> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{name} must be within [0,1], got {v}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    /// Share of the reranker score in the final score; clamped to `[0,1]`.
    pub weight: f64,
    pub timeout_ms: u64,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self { enabled: false, weight: 0.5, timeout_ms: 5_000, base_url: None, model: None }
    }
}

impl RerankSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if !self.weight.is_finite() {
            return Err(Error::InvalidConfig("rerank.weight must be a number".into()));
        }
        if self.enabled && self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("rerank.timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn clamped_weight(&self) -> f64 {
        self.weight.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self { base_url: None, model: "default".to_string(), timeout_ms: 10_000 }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
