//! Error types for the retrieval pipeline.

use recall_embeddings::EmbeddingError;
use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval pipeline.
///
/// Provider failures for individual candidates never show up here; they are
/// reported as skipped candidates instead.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Missing credentials, invalid settings or a corrupt cache store.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The provider rejected our credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Bad `k`, mismatched vector lengths, duplicate labels, empty input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The query label is not in the candidate set and no text was given.
    #[error("query label not found: {0}")]
    NotFound(String),

    /// Every candidate failed to resolve.
    #[error("no candidate embeddings could be resolved ({skipped} skipped)")]
    EmptyCandidates { skipped: usize },

    /// The query's own embedding could not be resolved.
    #[error("query embedding unavailable: {0}")]
    QueryUnavailable(String),

    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(EmbeddingError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::CorruptStore { .. }
            | EmbeddingError::UnsupportedStoreVersion { .. }
            | EmbeddingError::ProviderNotConfigured(_) => {
                RetrievalError::Configuration(err.to_string())
            }
            EmbeddingError::AuthFailed(_) => RetrievalError::Authentication(err.to_string()),
            EmbeddingError::InvalidInput(_) | EmbeddingError::DimensionMismatch { .. } => {
                RetrievalError::InvalidInput(err.to_string())
            }
            other => RetrievalError::Embedding(other),
        }
    }
}
