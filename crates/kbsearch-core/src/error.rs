use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lexical index error: {0}")]
    Lexical(String),

    #[error("Vector index error: {0}")]
    Vector(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Reranker error: {0}")]
    Rerank(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn lexical(e: impl Display) -> Self {
        Self::Lexical(e.to_string())
    }

    pub fn vector(e: impl Display) -> Self {
        Self::Vector(e.to_string())
    }

    /// Configuration errors are the only ones raised before any work starts.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
