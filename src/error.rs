//! Error types for Limbic

use thiserror::Error;

/// Result type alias for Limbic operations
pub type Result<T> = std::result::Result<T, LimbicError>;

/// Main error type for Limbic
#[derive(Error, Debug)]
pub enum LimbicError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Engram not found: {0}")]
    NotFound(i64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("All embedding providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("Provider rate limited: retry after {0} seconds")]
    ProviderRateLimited(u64),

    #[error("Write serializer timed out after {0} seconds")]
    WriteTimeout(u64),

    #[error("Retrieval leg timed out: {0}")]
    LegTimeout(String),

    #[error("Retrieval leg crashed: {0}")]
    LegCrashed(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LimbicError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LimbicError::Http(_)
                | LimbicError::ProviderRateLimited(_)
                | LimbicError::WriteTimeout(_)
                | LimbicError::LegTimeout(_)
        )
    }

    /// True for errors the retrieval fan-out absorbs instead of surfacing
    pub fn is_absorbed_by_retrieval(&self) -> bool {
        matches!(self, LimbicError::LegTimeout(_) | LimbicError::LegCrashed(_))
    }
}
