//! Retrieval pipeline implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt, TryStreamExt};
use recall_embeddings::{
    CacheKey, Embedding, EmbeddingCache, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse,
    Lookup, RetryError, RetryPolicy, SimilarityResult, UnitVector, Unavailable, rank_normalized,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::candidate::{CandidateSet, Query};
use crate::config::{PricingConfig, RetrievalConfig};
use crate::error::{Result, RetrievalError};

/// Semantic retrieval over labelled candidates.
///
/// Every candidate's embedding goes through the shared [`EmbeddingCache`];
/// only misses reach the provider, wrapped in the retry policy. Candidates
/// whose embedding cannot be obtained are skipped and reported rather than
/// failing the whole request.
pub struct Retriever<P> {
    provider: Arc<P>,
    cache: Arc<EmbeddingCache>,
    retry: RetryPolicy,
    model: String,
    concurrency: usize,
    pricing: PricingConfig,

    /// Unit-length copies of cached vectors, tagged with the cache generation
    /// they were read under, so each vector is normalized once.
    normalized: RwLock<HashMap<CacheKey, (u64, UnitVector)>>,

    usage: UsageCounters,
}

#[derive(Default)]
struct UsageCounters {
    cache_hits: AtomicU64,
    computed: AtomicU64,
    tokens: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone)]
enum Resolution {
    Ready(UnitVector),
    Skipped(String),
}

/// A candidate left out because its embedding was unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub label: String,
    pub reason: String,
}

/// Result of [`Retriever::retrieve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    /// Best matches, highest score first.
    pub results: Vec<SimilarityResult>,

    /// Candidates that could not be ranked.
    pub skipped: Vec<SkippedCandidate>,
}

impl Retrieval {
    pub fn labels(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Result of [`Retriever::warm_cache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    /// Candidates that now have a cached embedding.
    pub resolved: usize,

    /// Candidates whose embedding could not be obtained.
    pub skipped: Vec<SkippedCandidate>,
}

/// Provider usage since the retriever was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub cache_hits: u64,
    pub embeddings_computed: u64,
    pub tokens_used: u64,
    pub candidates_skipped: u64,
    pub estimated_cost_usd: f64,
}

impl<P: EmbeddingProvider> Retriever<P> {
    /// Create a retriever around an existing cache.
    pub fn new(provider: P, cache: Arc<EmbeddingCache>, config: &RetrievalConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            cache,
            retry: config.retry.clone(),
            model: config.model.clone(),
            concurrency: config.concurrency.max(1),
            pricing: config.pricing.clone(),
            normalized: RwLock::new(HashMap::new()),
            usage: UsageCounters::default(),
        }
    }

    /// Validate `config`, open the cache it names and create a retriever.
    pub async fn from_config(provider: P, config: &RetrievalConfig) -> Result<Self> {
        config.validate()?;

        let cache = match &config.cache.path {
            Some(path) => EmbeddingCache::with_persistence(path).await?,
            None => EmbeddingCache::new(),
        };

        info!(
            "Retriever ready: provider {}, model {}, {} cached embeddings",
            provider.name(),
            config.model,
            cache.len().await
        );

        Ok(Self::new(provider, Arc::new(cache), config))
    }

    /// The shared embedding cache.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Model identifier used for every cache key.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Provider usage so far.
    pub fn usage(&self) -> UsageStats {
        let tokens_used = self.usage.tokens.load(Ordering::Relaxed);
        UsageStats {
            cache_hits: self.usage.cache_hits.load(Ordering::Relaxed),
            embeddings_computed: self.usage.computed.load(Ordering::Relaxed),
            tokens_used,
            candidates_skipped: self.usage.skipped.load(Ordering::Relaxed),
            estimated_cost_usd: self.pricing.cost_usd(tokens_used),
        }
    }

    /// Rank `candidates` against `query` and return the best `k`.
    ///
    /// A query given by label reuses that candidate's embedding and never
    /// matches itself.
    pub async fn retrieve(
        &self,
        query: &Query,
        candidates: &CandidateSet,
        k: usize,
    ) -> Result<Retrieval> {
        if k == 0 {
            return Err(RetrievalError::InvalidInput("k must be at least 1".to_string()));
        }
        if candidates.is_empty() {
            return Err(RetrievalError::InvalidInput(
                "candidate set is empty".to_string(),
            ));
        }

        let own_label = query.label_str().filter(|label| candidates.contains(label));
        if let Some(label) = query.label_str()
            && own_label.is_none()
            && query.text_str().is_none()
        {
            return Err(RetrievalError::NotFound(label.to_string()));
        }

        let (ready, skipped) = self.resolve_candidates(candidates).await?;
        if ready.is_empty() {
            return Err(RetrievalError::EmptyCandidates {
                skipped: skipped.len(),
            });
        }

        let own_vector = own_label.and_then(|label| {
            ready
                .iter()
                .find(|(id, _)| id == label)
                .map(|(_, v)| v.clone())
        });

        let query_vector = match (own_vector, query.text_str()) {
            (Some(v), _) => v,
            (None, Some(text)) => match self.resolve(&self.key(text)).await? {
                Resolution::Ready(v) => v,
                Resolution::Skipped(reason) => {
                    return Err(RetrievalError::QueryUnavailable(reason));
                }
            },
            (None, None) => {
                let label = own_label.unwrap_or_default();
                return Err(RetrievalError::QueryUnavailable(format!(
                    "embedding for {label:?} could not be resolved"
                )));
            }
        };

        let results = rank_normalized(&query_vector, &ready, k, own_label)?;

        info!(
            "Retrieved {} of {} candidates (k={k}, {} skipped)",
            results.len(),
            candidates.len(),
            skipped.len()
        );

        Ok(Retrieval { results, skipped })
    }

    /// Make sure every candidate has a cached embedding, without querying.
    pub async fn warm_cache(&self, candidates: &CandidateSet) -> Result<WarmReport> {
        let (ready, skipped) = self.resolve_candidates(candidates).await?;

        info!(
            "Warmed cache: {} resolved, {} skipped",
            ready.len(),
            skipped.len()
        );

        Ok(WarmReport {
            resolved: ready.len(),
            skipped,
        })
    }

    fn key(&self, text: &str) -> CacheKey {
        CacheKey::new(text, self.model.as_str())
    }

    /// Resolve every candidate, in input order. Each distinct text is
    /// resolved once even if several labels share it.
    async fn resolve_candidates(
        &self,
        candidates: &CandidateSet,
    ) -> Result<(Vec<(String, UnitVector)>, Vec<SkippedCandidate>)> {
        let keyed: Vec<(&str, CacheKey)> = candidates
            .iter()
            .map(|c| (c.label.as_str(), self.key(&c.text)))
            .collect();

        let mut seen = HashSet::new();
        let unique: Vec<CacheKey> = keyed
            .iter()
            .filter(|(_, key)| seen.insert(key))
            .map(|(_, key)| key.clone())
            .collect();

        debug!(
            "Resolving {} candidates ({} distinct texts)",
            keyed.len(),
            unique.len()
        );

        let resolved: HashMap<CacheKey, Resolution> = stream::iter(unique)
            .map(|key| async move {
                let resolution = self.resolve(&key).await?;
                Ok::<_, RetrievalError>((key, resolution))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut ready = Vec::with_capacity(keyed.len());
        let mut skipped = Vec::new();
        for (label, key) in keyed {
            match resolved.get(&key) {
                Some(Resolution::Ready(v)) => ready.push((label.to_string(), v.clone())),
                Some(Resolution::Skipped(reason)) => {
                    warn!("Skipping candidate {label:?}: {reason}");
                    skipped.push(SkippedCandidate {
                        label: label.to_string(),
                        reason: reason.clone(),
                    });
                }
                None => {}
            }
        }

        self.usage
            .skipped
            .fetch_add(skipped.len() as u64, Ordering::Relaxed);

        Ok((ready, skipped))
    }

    /// Resolve one key to a unit vector, through the cache.
    ///
    /// Credential failures are returned as errors since every later call
    /// would fail the same way; any other failure becomes a skip.
    async fn resolve(&self, key: &CacheKey) -> Result<Resolution> {
        let memo = self.normalized.read().await.get(key).cloned();
        if let Some((seen, unit)) = memo
            && self.cache.generation_of(key).await == Some(seen)
        {
            self.usage.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Resolution::Ready(unit));
        }

        // Read before the lookup so a concurrent removal leaves the memo stale
        // rather than mislabelled.
        let generation = self.cache.generation().await;
        let lookup = self
            .cache
            .get_or_compute(key, |key| self.compute(key))
            .await?;

        match lookup {
            Lookup::Hit(embedding) => {
                self.usage.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Resolution::Ready(
                    self.memoize(key, generation, embedding).await,
                ))
            }
            Lookup::Computed {
                embedding,
                tokens_used,
            } => {
                self.usage.computed.fetch_add(1, Ordering::Relaxed);
                self.usage
                    .tokens
                    .fetch_add(tokens_used.unwrap_or(0), Ordering::Relaxed);
                Ok(Resolution::Ready(
                    self.memoize(key, generation, embedding).await,
                ))
            }
            Lookup::Unavailable(Unavailable::Provider(err)) if err.is_auth() => {
                Err(err.into_last_error().into())
            }
            Lookup::Unavailable(reason) => {
                self.normalized.write().await.remove(key);
                Ok(Resolution::Skipped(reason.to_string()))
            }
        }
    }

    async fn compute(&self, key: CacheKey) -> std::result::Result<EmbeddingResponse, RetryError> {
        let label = format!("embed {:?} ({})", key.preview(), key.model());
        self.retry
            .run(&label, || {
                self.provider
                    .embed(EmbeddingRequest::new(key.text()).with_model(key.model()))
            })
            .await
    }

    async fn memoize(
        &self,
        key: &CacheKey,
        generation: u64,
        embedding: Embedding,
    ) -> UnitVector {
        let unit = UnitVector::new(embedding);
        self.normalized
            .write()
            .await
            .insert(key.clone(), (generation, unit.clone()));
        unit
    }
}
