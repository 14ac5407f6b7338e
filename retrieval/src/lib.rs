//! # Retrieval
//!
//! Embedding-cache-backed semantic retrieval: given a set of labelled texts
//! (movie plots, document pages) and a query, return the most similar
//! labels by cosine similarity of their embeddings.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Retriever                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  CandidateSet ──► EmbeddingCache ──miss──► RetryPolicy          │
//! │                        │                       │                │
//! │                        │                       ▼                │
//! │                        │               EmbeddingProvider        │
//! │                        ▼                                        │
//! │                 unit vectors ──► rank (top-k, no self-match)    │
//! │                                        │                        │
//! │                                        ▼                        │
//! │                                    Retrieval                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use recall_retrieval::{CandidateSet, Credentials, Query, RetrievalConfig, Retriever};
//!
//! let config = RetrievalConfig::load("recall.toml")?;
//! let provider = config.build_provider(&Credentials::from_env()?)?;
//! let retriever = Retriever::from_config(provider, &config).await?;
//!
//! let movies = CandidateSet::from_pairs([
//!     ("Alien", "A crew aboard a spaceship ..."),
//!     ("Heat", "A group of bank robbers ..."),
//! ])?;
//! let found = retriever.retrieve(&Query::label("Alien"), &movies, 5).await?;
//! ```

pub mod candidate;
pub mod config;
pub mod engine;
pub mod error;

pub use candidate::{Candidate, CandidateSet, Query};
pub use config::{Credentials, RetrievalConfig};
pub use engine::{Retrieval, Retriever, SkippedCandidate, UsageStats, WarmReport};
pub use error::{Result, RetrievalError};

// Re-export from dependencies for convenience
pub use recall_embeddings::{
    EmbeddingCache, EmbeddingProvider, OpenAIProvider, RetryPolicy, SimilarityResult,
};
