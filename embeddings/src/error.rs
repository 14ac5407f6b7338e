//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Could not reach the provider.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The provider did not answer in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The provider answered with a 5xx status.
    #[error("server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The provider rejected the request as malformed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// API request failed for a reason we do not recognise.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Caller supplied unusable arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The backing store exists but does not hold a valid cache.
    #[error("corrupt cache store {path}: {reason}")]
    CorruptStore { path: String, reason: String },

    /// The backing store was written by an incompatible version.
    #[error("unsupported cache store version {found} (expected {expected})")]
    UnsupportedStoreVersion { found: u32, expected: u32 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// How the retry policy should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Provider asked us to slow down.
    RateLimit,
    /// Connectivity, timeout or server-side hiccup.
    Transient,
    /// Bad credentials or a request the provider will never accept.
    Fatal,
    /// Anything else. Not retried.
    Unclassified,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::RateLimit | FailureClass::Transient)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureClass::RateLimit => "rate-limit",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
            FailureClass::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

impl EmbeddingError {
    /// Classify this error for retry purposes.
    pub fn classify(&self) -> FailureClass {
        match self {
            EmbeddingError::RateLimited { .. } => FailureClass::RateLimit,
            EmbeddingError::ConnectionFailed(_)
            | EmbeddingError::Timeout(_)
            | EmbeddingError::ServerError { .. } => FailureClass::Transient,
            EmbeddingError::Http(e) if e.is_timeout() || e.is_connect() => {
                FailureClass::Transient
            }
            EmbeddingError::AuthFailed(_)
            | EmbeddingError::Malformed(_)
            | EmbeddingError::ProviderNotConfigured(_) => FailureClass::Fatal,
            _ => FailureClass::Unclassified,
        }
    }

    /// Whether this error means the credentials are missing or rejected.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            EmbeddingError::AuthFailed(_) | EmbeddingError::ProviderNotConfigured(_)
        )
    }
}
