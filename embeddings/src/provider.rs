//! Embedding providers.
//!
//! The OpenAI provider also speaks the Azure OpenAI flavour of the API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Request for generating embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Model to use (provider-specific).
    pub model: Option<String>,
}

impl EmbeddingRequest {
    /// Create a new embedding request.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Response from embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The generated embedding.
    pub embedding: Embedding,

    /// Model used to generate the embedding.
    pub model: String,

    /// Token usage (if available).
    pub tokens_used: Option<u64>,
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the default model for this provider.
    fn default_model(&self) -> &str;

    /// Generate an embedding for the given text.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone)]
enum Flavor {
    OpenAI,
    Azure { api_version: String },
}

/// OpenAI embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL (or Azure resource endpoint).
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Default model (the deployment name on Azure).
    default_model: String,

    flavor: Flavor,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            default_model: "text-embedding-3-large".to_string(),
            flavor: Flavor::OpenAI,
        }
    }

    /// Create a provider for an Azure OpenAI resource.
    pub fn azure(endpoint: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            base_url: endpoint.into().trim_end_matches('/').to_string(),
            flavor: Flavor::Azure {
                api_version: api_version.into(),
            },
            ..Self::new()
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    fn request(&self, model: &str, api_key: &str) -> reqwest::RequestBuilder {
        match &self.flavor {
            Flavor::OpenAI => self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {api_key}")),
            Flavor::Azure { api_version } => self
                .client
                .post(format!(
                    "{}/openai/deployments/{model}/embeddings",
                    self.base_url
                ))
                .query(&[("api-version", api_version.as_str())])
                .header("api-key", api_key),
        }
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn status_error(
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
    body: String,
) -> EmbeddingError {
    use reqwest::StatusCode;

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EmbeddingError::AuthFailed(body),
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => EmbeddingError::Timeout(body),
        s if s.is_server_error() => EmbeddingError::ServerError {
            status: s.as_u16(),
            message: body,
        },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            EmbeddingError::Malformed(body)
        }
        s => EmbeddingError::ApiRequest(format!("API error ({s}): {body}")),
    }
}

/// Map a transport failure onto the error taxonomy.
fn transport_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout(err.to_string())
    } else if err.is_connect() {
        EmbeddingError::ConnectionFailed(err.to_string())
    } else {
        EmbeddingError::Http(err)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        match self.flavor {
            Flavor::OpenAI => "openai",
            Flavor::Azure { .. } => "azure-openai",
        }
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            EmbeddingError::ProviderNotConfigured(format!("{} API key is not set", self.name()))
        })?;

        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        debug!("Generating embedding with model: {model}");

        let body = serde_json::json!({
            "input": request.text,
            "model": model,
            "encoding_format": "float"
        });

        let response = self
            .request(&model, api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, error_text));
        }

        let result: OpenAIEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))?
            .embedding;

        if embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse(
                "Empty embedding in response".to_string(),
            ));
        }

        let tokens_used = result.usage.map(|u| u.total_tokens);

        info!("Generated embedding with {} dimensions", embedding.len());

        Ok(EmbeddingResponse {
            embedding,
            model: result.model.unwrap_or(model),
            tokens_used,
        })
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    model: Option<String>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": [0.25, -0.5, 1.0]}],
            "model": "text-embedding-3-large",
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        })
    }

    async fn embed_with_status(status: u16) -> EmbeddingError {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        OpenAIProvider::new()
            .with_api_key("sk-test")
            .with_base_url(server.uri())
            .embed(EmbeddingRequest::new("hello"))
            .await
            .unwrap_err()
    }

    #[test]
    fn test_embedding_request() {
        let request = EmbeddingRequest::new("Hello world").with_model("text-embedding-3-small");

        assert_eq!(request.text, "Hello world");
        assert_eq!(request.model, Some("text-embedding-3-small".to_string()));
    }

    #[tokio::test]
    async fn test_openai_embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "input": "hello",
                "model": "text-embedding-3-large",
                "encoding_format": "float"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("sk-test")
            .with_base_url(server.uri());
        let response = provider.embed(EmbeddingRequest::new("hello")).await.unwrap();

        assert_eq!(response.embedding, vec![0.25, -0.5, 1.0]);
        assert_eq!(response.tokens_used, Some(4));
        assert_eq!(response.model, "text-embedding-3-large");
    }

    #[tokio::test]
    async fn test_azure_embed_uses_deployment_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/embed-large/embeddings"))
            .and(query_param("api-version", "2024-02-01"))
            .and(header("api-key", "azure-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::azure(format!("{}/", server.uri()), "2024-02-01")
            .with_api_key("azure-key")
            .with_model("embed-large");
        assert_eq!(provider.name(), "azure-openai");

        let response = provider.embed(EmbeddingRequest::new("hello")).await.unwrap();
        assert_eq!(response.embedding.len(), 3);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        assert!(matches!(
            embed_with_status(401).await,
            EmbeddingError::AuthFailed(_)
        ));
        assert!(matches!(
            embed_with_status(429).await,
            EmbeddingError::RateLimited {
                retry_after_secs: 60
            }
        ));
        assert!(matches!(
            embed_with_status(504).await,
            EmbeddingError::Timeout(_)
        ));
        assert!(matches!(
            embed_with_status(503).await,
            EmbeddingError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            embed_with_status(400).await,
            EmbeddingError::Malformed(_)
        ));
        assert!(matches!(
            embed_with_status(418).await,
            EmbeddingError::ApiRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_data_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [], "model": "m"})),
            )
            .mount(&server)
            .await;

        let err = OpenAIProvider::new()
            .with_api_key("sk-test")
            .with_base_url(server.uri())
            .embed(EmbeddingRequest::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let provider = OpenAIProvider {
            api_key: None,
            ..OpenAIProvider::new()
        };
        assert!(!provider.is_available());

        let err = provider
            .embed(EmbeddingRequest::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderNotConfigured(_)));
        assert!(err.is_auth());
    }
}
