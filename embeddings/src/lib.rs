//! # Embeddings
//!
//! Embedding generation, caching and cosine ranking for semantic retrieval.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through a remote model
//! - **Caching**: Persistent, write-once cache keyed by text and model
//! - **Retries**: Bounded randomized exponential backoff around provider calls
//! - **Ranking**: Top-k cosine similarity with self-match exclusion
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingCache ──miss──► RetryPolicy ──► EmbeddingProvider     │
//! │       │                                        │                │
//! │       ▼                                        ▼                │
//! │  JSON store (versioned)                  OpenAI / Azure         │
//! │                                                                 │
//! │  similarity::rank ──► Vec<SimilarityResult>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod provider;
pub mod retry;
pub mod similarity;

pub use cache::{CacheKey, CacheStats, EmbeddingCache, Lookup, Unavailable};
pub use error::{EmbeddingError, FailureClass, Result};
pub use provider::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, OpenAIProvider};
pub use retry::{RetryError, RetryPolicy};
pub use similarity::{SimilarityResult, UnitVector, cosine_similarity, rank, rank_normalized};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
