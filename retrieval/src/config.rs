//! Configuration for the retrieval pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use recall_embeddings::{OpenAIProvider, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RetrievalError};

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "text-embedding-3-large";

/// Configuration for the retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Model identifier. Part of every cache key.
    pub model: String,

    /// How many candidate embeddings to resolve at once.
    pub concurrency: usize,

    /// Embedding cache configuration.
    pub cache: CacheConfig,

    /// Embedding provider configuration.
    pub provider: ProviderConfig,

    /// Retry policy around provider calls.
    pub retry: RetryPolicy,

    /// Token pricing used for cost estimates.
    pub pricing: PricingConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            concurrency: 4,
            cache: CacheConfig::default(),
            provider: ProviderConfig::default(),
            retry: RetryPolicy::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl RetrievalConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults. The result is validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        info!("Loaded retrieval config from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RetrievalError::Configuration(e.to_string()))
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the cache path.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache.path = Some(path.into());
        self
    }

    /// Keep the cache in memory only.
    pub fn without_persistence(mut self) -> Self {
        self.cache.path = None;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the resolution concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RetrievalError::Configuration(msg));

        if self.model.trim().is_empty() {
            return invalid("model must not be empty".to_string());
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".to_string());
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            return invalid(format!(
                "retry.max_attempts must be between 1 and 10, got {}",
                self.retry.max_attempts
            ));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return invalid(format!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.min_delay.as_millis(),
                self.retry.max_delay.as_millis()
            ));
        }
        if self.pricing.cost_per_million_tokens < 0.0 {
            return invalid("pricing.cost_per_million_tokens must not be negative".to_string());
        }
        Ok(())
    }

    /// Build the HTTP provider described by this configuration.
    pub fn build_provider(&self, credentials: &Credentials) -> Result<OpenAIProvider> {
        let endpoint = credentials
            .endpoint
            .clone()
            .or_else(|| self.provider.endpoint.clone());

        let provider = match self.provider.kind {
            ProviderKind::OpenAI => {
                let provider = OpenAIProvider::new();
                match endpoint {
                    Some(url) => provider.with_base_url(url),
                    None => provider,
                }
            }
            ProviderKind::Azure => {
                let endpoint = endpoint.ok_or_else(|| {
                    RetrievalError::Configuration(
                        "azure provider needs OPENAI_ENDPOINT or provider.endpoint".to_string(),
                    )
                })?;
                let api_version = credentials
                    .api_version
                    .clone()
                    .unwrap_or_else(|| self.provider.api_version.clone());
                OpenAIProvider::azure(endpoint, api_version)
            }
        };

        Ok(provider
            .with_api_key(credentials.api_key.clone())
            .with_model(self.model.clone())
            .with_timeout(Duration::from_secs(self.provider.timeout_secs))?)
    }
}

/// Configuration for the embedding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backing store. `None` keeps the cache in memory.
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("embeddings_cache.json")),
        }
    }
}

/// Which API flavour to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// api.openai.com or a compatible server.
    #[serde(rename = "openai")]
    OpenAI,
    /// An Azure OpenAI resource.
    Azure,
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Base URL (OpenAI) or resource endpoint (Azure).
    pub endpoint: Option<String>,

    /// Azure API version.
    pub api_version: String,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAI,
            endpoint: None,
            api_version: "2024-02-01".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Token pricing for cost estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// USD per million tokens embedded.
    pub cost_per_million_tokens: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cost_per_million_tokens: 0.13, // text-embedding-3-large
        }
    }
}

impl PricingConfig {
    pub fn cost_usd(&self, tokens: u64) -> f64 {
        tokens as f64 / 1_000_000.0 * self.cost_per_million_tokens
    }
}

/// Provider credentials, read from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment, after loading `.env`
    /// if one exists.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(RetrievalError::Configuration(format!(".env: {e}"))),
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build credentials from an arbitrary variable lookup.
    ///
    /// The endpoint is read from `OPENAI_ENDPOINT`, falling back to
    /// `OPENAI_API_ENDPOINT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = non_empty("OPENAI_API_KEY").ok_or_else(|| {
            RetrievalError::Configuration("OPENAI_API_KEY is not set".to_string())
        })?;

        Ok(Self {
            api_key,
            endpoint: non_empty("OPENAI_ENDPOINT").or_else(|| non_empty("OPENAI_API_ENDPOINT")),
            api_version: non_empty("OPENAI_API_VERSION"),
        })
    }
}
