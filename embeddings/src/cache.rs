//! Persistent embedding cache.
//!
//! Entries are keyed by `(normalized text, model)` and written at most once.
//! The backing store is a versioned JSON document that is replaced atomically
//! on every flush, so a reader sees either the old or the new store, never a
//! half-written one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::provider::EmbeddingResponse;
use crate::retry::RetryError;

/// Version tag written into every store file.
pub const STORE_VERSION: u32 = 1;

/// Key for a cached embedding.
///
/// Newlines in the text are folded into spaces before the key is built, so
/// the same passage extracted with different line breaks shares an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    text: String,
    model: String,
}

impl CacheKey {
    pub fn new(text: &str, model: impl Into<String>) -> Self {
        Self {
            text: normalize_text(text),
            model: model.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Short form of the text for log lines.
    pub fn preview(&self) -> String {
        const MAX: usize = 40;
        if self.text.chars().count() <= MAX {
            self.text.clone()
        } else {
            let head: String = self.text.chars().take(MAX).collect();
            format!("{head}...")
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// A cache entry as it appears in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The normalized text that was embedded.
    pub text: String,

    /// Model used to generate the embedding.
    pub model: String,

    /// The embedding vector.
    pub embedding: Embedding,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Why [`EmbeddingCache::get_or_compute`] could not produce a vector.
#[derive(Error, Debug)]
pub enum Unavailable {
    /// The provider call failed or ran out of retries.
    #[error(transparent)]
    Provider(#[from] RetryError),

    /// The provider answered, but with a vector the cache will not store.
    #[error("unusable embedding: {0}")]
    Unusable(EmbeddingError),
}

impl Unavailable {
    /// Whether the failure was caused by bad or missing credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            Unavailable::Provider(err) => err.is_auth(),
            Unavailable::Unusable(_) => false,
        }
    }
}

/// Outcome of a cache lookup that may fall through to the provider.
#[derive(Debug)]
pub enum Lookup {
    /// Served from the cache; no provider call was made.
    Hit(Embedding),

    /// Computed by the provider and now stored.
    Computed {
        embedding: Embedding,
        tokens_used: Option<u64>,
    },

    /// Nothing was stored. Callers must skip this item rather than treat it
    /// as a zero vector.
    Unavailable(Unavailable),
}

impl Lookup {
    pub fn embedding(&self) -> Option<&Embedding> {
        match self {
            Lookup::Hit(embedding) | Lookup::Computed { embedding, .. } => Some(embedding),
            Lookup::Unavailable(_) => None,
        }
    }

    pub fn into_embedding(self) -> Option<Embedding> {
        match self {
            Lookup::Hit(embedding) | Lookup::Computed { embedding, .. } => Some(embedding),
            Lookup::Unavailable(_) => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

#[derive(Default)]
struct Entries {
    vectors: HashMap<CacheKey, Embedding>,
    /// Vector length recorded for each model.
    dimensions: HashMap<String, usize>,
    /// Bumped whenever an entry is removed or the contents are replaced.
    generation: u64,
}

impl Entries {
    fn check(&self, key: &CacheKey, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "empty embedding for {:?}",
                key.preview()
            )));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(format!(
                "non-finite component in embedding for {:?}",
                key.preview()
            )));
        }
        match self.dimensions.get(key.model()) {
            Some(&expected) if expected != embedding.len() => {
                Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Insert unless present. Returns whether the entry was new.
    fn insert(&mut self, key: CacheKey, embedding: Embedding) -> Result<bool> {
        if self.vectors.contains_key(&key) {
            return Ok(false);
        }
        self.check(&key, &embedding)?;
        self.dimensions
            .entry(key.model().to_string())
            .or_insert(embedding.len());
        self.vectors.insert(key, embedding);
        Ok(true)
    }

    /// Swap in `other`'s entries and start a new generation.
    fn replace(&mut self, other: Entries) {
        self.vectors = other.vectors;
        self.dimensions = other.dimensions;
        self.generation += 1;
    }

    fn rebuild_dimensions(&mut self) {
        self.dimensions = self
            .vectors
            .iter()
            .map(|(k, v)| (k.model().to_string(), v.len()))
            .collect();
    }
}

/// Cache for embeddings to avoid redundant API calls.
///
/// Entries are never evicted; they stay until the caller removes them or
/// clears the cache.
pub struct EmbeddingCache {
    /// In-memory view of the store.
    entries: RwLock<Entries>,

    /// One lock per key that is currently being computed.
    in_flight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,

    /// Serializes writers of the backing store.
    persist_lock: Mutex<()>,

    /// Path for persistent cache storage.
    store_path: Option<PathBuf>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache {
    /// Create a new in-memory cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            in_flight: Mutex::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            store_path: None,
        }
    }

    /// Create a cache backed by `path` and load whatever is stored there.
    ///
    /// A missing file yields an empty cache. A file that cannot be read as a
    /// cache store is an error.
    pub async fn with_persistence(path: impl AsRef<Path>) -> Result<Self> {
        let cache = Self {
            store_path: Some(path.as_ref().to_path_buf()),
            ..Self::new()
        };
        cache.load().await?;
        Ok(cache)
    }

    /// Path of the backing store, if any.
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Get an embedding from the cache.
    pub async fn get(&self, key: &CacheKey) -> Option<Embedding> {
        self.entries.read().await.vectors.get(key).cloned()
    }

    /// Check if an embedding is cached.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().await.vectors.contains_key(key)
    }

    /// Current generation of the cache contents.
    ///
    /// Entries are write-once, so a vector read for a key stays current for as
    /// long as the generation is unchanged. Removing an entry, clearing the
    /// cache or reloading it from disk starts a new generation.
    pub async fn generation(&self) -> u64 {
        self.entries.read().await.generation
    }

    /// The current generation if `key` is cached, read atomically with the
    /// lookup.
    pub async fn generation_of(&self, key: &CacheKey) -> Option<u64> {
        let entries = self.entries.read().await;
        entries
            .vectors
            .contains_key(key)
            .then_some(entries.generation)
    }

    /// Vector length recorded for `model`.
    pub async fn dimension(&self, model: &str) -> Option<usize> {
        self.entries.read().await.dimensions.get(model).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.vectors.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Store an embedding unless the key is already present, then flush.
    ///
    /// Returns `false` when the key was already cached; the stored vector is
    /// left as it was.
    pub async fn put(&self, key: CacheKey, embedding: Embedding) -> Result<bool> {
        let inserted = self.entries.write().await.insert(key, embedding)?;
        if inserted {
            self.persist().await?;
        }
        Ok(inserted)
    }

    /// Return the cached vector for `key`, or compute, store and return it.
    ///
    /// Only one computation per key runs at a time: concurrent callers for
    /// the same uncached key wait for the first one and then observe its
    /// entry. Lookups of other keys are never blocked by a computation.
    ///
    /// A failed computation stores nothing and yields
    /// [`Lookup::Unavailable`]. Only persistence failures are returned as
    /// errors.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<Lookup>
    where
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<EmbeddingResponse, RetryError>>,
    {
        if let Some(embedding) = self.get(key).await {
            debug!("Cache hit for {:?} (model: {})", key.preview(), key.model());
            return Ok(Lookup::Hit(embedding));
        }

        let key_lock = self.key_lock(key).await;
        let guard = key_lock.lock().await;
        let result = self.compute_locked(key, compute).await;
        drop(guard);
        self.release_key_lock(key, key_lock).await;

        result
    }

    async fn compute_locked<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<Lookup>
    where
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<EmbeddingResponse, RetryError>>,
    {
        // Another caller may have filled the entry while we waited.
        if let Some(embedding) = self.get(key).await {
            debug!("Cache hit for {:?} after waiting", key.preview());
            return Ok(Lookup::Hit(embedding));
        }

        debug!("Cache miss for {:?} (model: {})", key.preview(), key.model());

        let response = match compute(key.clone()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "Embedding unavailable for {:?} (model: {}) after {} attempt(s): {err}",
                    key.preview(),
                    key.model(),
                    err.attempts()
                );
                return Ok(Lookup::Unavailable(Unavailable::Provider(err)));
            }
        };

        let embedding = response.embedding;
        if let Err(err) = self
            .entries
            .write()
            .await
            .insert(key.clone(), embedding.clone())
        {
            warn!(
                "Discarding embedding for {:?} (model: {}): {err}",
                key.preview(),
                key.model()
            );
            return Ok(Lookup::Unavailable(Unavailable::Unusable(err)));
        }

        self.persist().await?;
        debug!("Cached embedding for {:?} (model: {})", key.preview(), key.model());

        Ok(Lookup::Computed {
            embedding,
            tokens_used: response.tokens_used,
        })
    }

    async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn release_key_lock(&self, key: &CacheKey, key_lock: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // The map holds one reference and we hold another; anything above
        // that is a caller still waiting on this key.
        if Arc::strong_count(&key_lock) <= 2 {
            in_flight.remove(key);
        }
    }

    /// Remove an embedding from the cache and flush.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let removed = {
            let mut entries = self.entries.write().await;
            let removed = entries.vectors.remove(key).is_some();
            if removed {
                entries.rebuild_dimensions();
                entries.generation += 1;
            }
            removed
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Clear the entire cache and flush.
    pub async fn clear(&self) -> Result<()> {
        self.entries.write().await.replace(Entries::default());
        self.persist().await?;
        info!("Cleared embedding cache");
        Ok(())
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.vectors.len(),
            models: entries
                .vectors
                .keys()
                .map(|k| k.model().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            dimensions: entries
                .dimensions
                .iter()
                .map(|(m, d)| (m.clone(), *d))
                .collect(),
        }
    }

    /// Write the cache to its backing store, if it has one.
    pub async fn persist(&self) -> Result<()> {
        let Some(ref path) = self.store_path else {
            return Ok(());
        };

        let _writer = self.persist_lock.lock().await;

        let content = {
            let entries = self.entries.read().await;
            let mut stored: Vec<CacheEntry> = entries
                .vectors
                .iter()
                .map(|(k, v)| CacheEntry {
                    text: k.text.clone(),
                    model: k.model.clone(),
                    embedding: v.clone(),
                })
                .collect();
            stored.sort_by(|a, b| (&a.model, &a.text).cmp(&(&b.model, &b.text)));
            serde_json::to_vec(&StoreFile {
                version: STORE_VERSION,
                entries: stored,
            })?
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(path);
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, path).await?;
        debug!("Saved embedding cache to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory contents with the backing store.
    ///
    /// A missing file leaves the cache empty.
    pub async fn load(&self) -> Result<()> {
        let Some(ref path) = self.store_path else {
            return Ok(());
        };

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No embedding cache at {}, starting empty",
                    path.display()
                );
                self.entries.write().await.replace(Entries::default());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let loaded = parse_store(path, &content)?;
        let count = loaded.vectors.len();
        self.entries.write().await.replace(loaded);

        info!("Loaded {count} cache entries from {}", path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn parse_store(path: &Path, content: &[u8]) -> Result<Entries> {
    let corrupt = |reason: String| EmbeddingError::CorruptStore {
        path: path.display().to_string(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_slice(content).map_err(|e| corrupt(e.to_string()))?;
    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| corrupt("missing version tag".to_string()))?;
    if version != u64::from(STORE_VERSION) {
        return Err(EmbeddingError::UnsupportedStoreVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            expected: STORE_VERSION,
        });
    }

    let file: StoreFile = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;

    let mut entries = Entries::default();
    for entry in file.entries {
        let key = CacheKey::new(&entry.text, entry.model);
        let preview = key.preview();
        match entries.insert(key, entry.embedding) {
            Ok(true) => {}
            Ok(false) => return Err(corrupt(format!("duplicate entry for {preview:?}"))),
            Err(e) => return Err(corrupt(format!("entry {preview:?}: {e}"))),
        }
    }
    Ok(entries)
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache.
    pub entries: usize,

    /// Models with cached embeddings.
    pub models: Vec<String>,

    /// Vector length per model.
    pub dimensions: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::assert_ok;
    use tracing_test::traced_test;

    use crate::error::FailureClass;

    fn response(embedding: Embedding) -> EmbeddingResponse {
        EmbeddingResponse {
            embedding,
            model: "model".to_string(),
            tokens_used: Some(3),
        }
    }

    fn exhausted() -> RetryError {
        RetryError::Exhausted {
            attempts: 5,
            last: EmbeddingError::RateLimited {
                retry_after_secs: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_cache_put_get() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("hello", "model-1");
        let embedding = vec![1.0, 2.0, 3.0];

        let inserted = assert_ok!(cache.put(key.clone(), embedding.clone()).await);
        assert!(inserted);

        assert_eq!(cache.get(&key).await, Some(embedding));
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = EmbeddingCache::new();
        let result = cache.get(&CacheKey::new("not cached", "model-1")).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_put_is_write_once() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("a", "m");

        assert!(cache.put(key.clone(), vec![1.0, 0.0]).await.unwrap());
        assert!(!cache.put(key.clone(), vec![0.0, 1.0]).await.unwrap());
        assert_eq!(cache.get(&key).await, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_key_normalizes_newlines() {
        let a = CacheKey::new("line one\nline two", "m");
        let b = CacheKey::new("line one\r\nline two", "m");
        assert_eq!(a, b);
        assert_eq!(a.text(), "line one line two");
        assert_ne!(a, CacheKey::new("line one line two", "other-model"));
    }

    #[tokio::test]
    async fn test_get_or_compute_calls_provider_once() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("cat sitting", "m");
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let first = cache
            .get_or_compute(&key, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RetryError>(response(vec![0.1, 0.2]))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(&key, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RetryError>(response(vec![9.0, 9.0]))
            })
            .await
            .unwrap();

        assert!(matches!(first, Lookup::Computed { tokens_used: Some(3), .. }));
        assert!(second.is_hit());
        assert_eq!(first.into_embedding(), second.into_embedding());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_compute_stores_nothing() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("unlucky", "m");

        let lookup = cache
            .get_or_compute(&key, |_| async { Err::<EmbeddingResponse, _>(exhausted()) })
            .await
            .unwrap();

        assert!(matches!(lookup, Lookup::Unavailable(Unavailable::Provider(_))));
        assert!(lookup.embedding().is_none());
        assert!(!cache.contains(&key).await);
        assert!(logs_contain("Embedding unavailable"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_flagged() {
        let cache = EmbeddingCache::new();
        let lookup = cache
            .get_or_compute(&CacheKey::new("x", "m"), |_| async {
                Err::<EmbeddingResponse, _>(RetryError::Aborted {
                    attempt: 1,
                    class: FailureClass::Fatal,
                    source: EmbeddingError::AuthFailed("401".into()),
                })
            })
            .await
            .unwrap();

        match lookup {
            Lookup::Unavailable(reason) => assert!(reason.is_auth()),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_unusable() {
        let cache = EmbeddingCache::new();
        cache
            .put(CacheKey::new("first", "m"), vec![1.0, 0.0, 0.0])
            .await
            .unwrap();

        let key = CacheKey::new("second", "m");
        let lookup = cache
            .get_or_compute(&key, |_| async { Ok::<_, RetryError>(response(vec![1.0, 0.0])) })
            .await
            .unwrap();

        assert!(matches!(
            lookup,
            Lookup::Unavailable(Unavailable::Unusable(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }))
        ));
        assert!(!cache.contains(&key).await);

        // A different model has its own dimension.
        assert!(
            cache
                .put(CacheKey::new("second", "small"), vec![1.0, 0.0])
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_non_finite_vector_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = EmbeddingCache::with_persistence(&path).await.unwrap();

        let put = cache.put(CacheKey::new("n", "m"), vec![f32::NAN, 1.0]).await;
        assert!(matches!(put, Err(EmbeddingError::InvalidResponse(_))));

        let key = CacheKey::new("inf", "m");
        let lookup = cache
            .get_or_compute(&key, |_| async {
                Ok::<_, RetryError>(response(vec![f32::INFINITY, 0.0]))
            })
            .await
            .unwrap();
        assert!(matches!(lookup, Lookup::Unavailable(Unavailable::Unusable(_))));

        cache.put(CacheKey::new("ok", "m"), vec![0.5, 0.5]).await.unwrap();
        let reloaded = EmbeddingCache::with_persistence(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_vector_is_unusable() {
        let cache = EmbeddingCache::new();
        let lookup = cache
            .get_or_compute(&CacheKey::new("blank", "m"), |_| async {
                Ok::<_, RetryError>(response(Vec::new()))
            })
            .await
            .unwrap();
        assert!(matches!(lookup, Lookup::Unavailable(Unavailable::Unusable(_))));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_call() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("popular", "m");
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let compute = move |_: CacheKey| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, RetryError>(response(vec![0.5, 0.5]))
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_compute(&key, compute),
            cache.get_or_compute(&key, compute),
            cache.get_or_compute(&key, compute),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for lookup in [a.unwrap(), b.unwrap(), c.unwrap()] {
            assert_eq!(lookup.into_embedding(), Some(vec![0.5, 0.5]));
        }
        assert!(cache.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_round_trip_is_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/cache.json");
        let embedding = vec![0.1f32, -1.0e-7, 3.4028235e38, 1.0 / 3.0, f32::MIN_POSITIVE];

        {
            let cache = EmbeddingCache::with_persistence(&path).await.unwrap();
            cache
                .put(CacheKey::new("precise", "m"), embedding.clone())
                .await
                .unwrap();
        }

        let reloaded = EmbeddingCache::with_persistence(&path).await.unwrap();
        let stored = reloaded.get(&CacheKey::new("precise", "m")).await.unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&stored), bits(&embedding));
        assert_eq!(reloaded.dimension("m").await, Some(5));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_missing_store_starts_empty() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::with_persistence(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_store_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        for content in [
            "not json at all",
            r#"{"entries": []}"#,
            r#"{"version": 1, "entries": {"a": [1.0]}}"#,
            r#"{"version": 1, "entries": [
                {"text": "a", "model": "m", "embedding": [1.0, 2.0]},
                {"text": "b", "model": "m", "embedding": [1.0]}
            ]}"#,
            r#"{"version": 1, "entries": [
                {"text": "a", "model": "m", "embedding": [1.0]},
                {"text": "a", "model": "m", "embedding": [2.0]}
            ]}"#,
        ] {
            std::fs::write(&path, content).unwrap();
            let result = EmbeddingCache::with_persistence(&path).await;
            assert!(
                matches!(result, Err(EmbeddingError::CorruptStore { .. })),
                "expected corrupt store for {content}"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"version": 7, "entries": []}"#).unwrap();

        let result = EmbeddingCache::with_persistence(&path).await;
        assert!(matches!(
            result,
            Err(EmbeddingError::UnsupportedStoreVersion {
                found: 7,
                expected: STORE_VERSION
            })
        ));
    }

    #[tokio::test]
    async fn test_clear_and_remove_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = EmbeddingCache::with_persistence(&path).await.unwrap();

        cache.put(CacheKey::new("a", "m"), vec![1.0]).await.unwrap();
        cache.put(CacheKey::new("b", "m"), vec![2.0]).await.unwrap();
        assert!(cache.remove(&CacheKey::new("a", "m")).await.unwrap());
        assert!(!cache.remove(&CacheKey::new("a", "m")).await.unwrap());

        let reloaded = EmbeddingCache::with_persistence(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);

        cache.clear().await.unwrap();
        let reloaded = EmbeddingCache::with_persistence(&path).await.unwrap();
        assert!(reloaded.is_empty().await);
    }

    #[tokio::test]
    async fn test_generation_changes_only_when_entries_can_change() {
        let cache = EmbeddingCache::new();
        let key = CacheKey::new("a", "m");
        let start = cache.generation().await;
        assert_eq!(cache.generation_of(&key).await, None);

        cache.put(key.clone(), vec![1.0, 0.0]).await.unwrap();
        assert_eq!(cache.generation_of(&key).await, Some(start));

        cache.remove(&key).await.unwrap();
        assert_eq!(cache.generation_of(&key).await, None);
        cache.put(key.clone(), vec![0.0, 1.0]).await.unwrap();
        let after_remove = cache.generation_of(&key).await.unwrap();
        assert!(after_remove > start);

        cache.clear().await.unwrap();
        assert!(cache.generation().await > after_remove);
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = EmbeddingCache::new();
        cache.put(CacheKey::new("a", "large"), vec![1.0, 2.0, 3.0]).await.unwrap();
        cache.put(CacheKey::new("a", "small"), vec![1.0]).await.unwrap();
        cache.put(CacheKey::new("b", "small"), vec![2.0]).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.models, vec!["large".to_string(), "small".to_string()]);
        assert_eq!(stats.dimensions.get("large"), Some(&3));
        assert_eq!(stats.dimensions.get("small"), Some(&1));
    }
}
