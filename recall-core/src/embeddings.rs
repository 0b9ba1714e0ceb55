//! Embeddings module for Recall: pluggable embedding providers
//!
//! Provides an `EmbeddingBackend` trait with implementations for:
//! - **ONNX**: local embeddings via `all-MiniLM-L6-v2` (384-dim)
//! - **OpenAI-compatible**: any server exposing `POST /embeddings`
//!   (OpenAI, Ollama, llama.cpp, vLLM)
//! - **Hash**: deterministic feature-hashing embedder, offline and model-free
//!
//! Every backend is deterministic for identical input, so relevance scores are
//! reproducible across runs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::EmbeddingConfig;
use crate::error::ErrorKind;

/// Default ONNX (all-MiniLM-L6-v2) embedding dimensions
pub const ONNX_DIMENSIONS: usize = 384;

/// Default dimensions for the hashing embedder
pub const HASH_DIMENSIONS: usize = 384;

// ============================================================================
// EmbeddingBackend trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a document for storage.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a search query. Backends with asymmetric query/document models
    /// can override this. Defaults to calling `embed()`.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }

    /// Returns the embedding dimension (e.g., 384).
    fn dimensions(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Embedding generation errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing embedding in response")]
    MissingEmbedding,

    #[error("All {attempts} retry attempts failed: {last_error}")]
    RetryExhausted { attempts: usize, last_error: String },

    #[error("ONNX model not found at {path}; download all-MiniLM-L6-v2 into the model directory")]
    ModelNotFound { path: String },

    #[error("ONNX inference error: {0}")]
    OnnxInference(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Unknown embedding backend: {0}")]
    UnknownBackend(String),

    #[error("Cannot embed empty text")]
    EmptyInput,
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::InvalidDimensions { .. }
            | EmbeddingError::ModelNotFound { .. }
            | EmbeddingError::OnnxInference(_)
            | EmbeddingError::Tokenizer(_)
            | EmbeddingError::UnknownBackend(_) => ErrorKind::Configuration,
            EmbeddingError::Api { code, .. } if is_client_error(*code) => {
                ErrorKind::Configuration
            }
            EmbeddingError::EmptyInput => ErrorKind::InvalidArgument,
            EmbeddingError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            _ => ErrorKind::StoreUnavailable,
        }
    }
}

/// 4xx responses that retrying will not fix (bad key, unknown model).
fn is_client_error(code: u16) -> bool {
    (400..500).contains(&code) && code != 408 && code != 429
}

// ============================================================================
// Config types
// ============================================================================

/// OpenAI-compatible embedding client configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub request_timeout: Duration,
}

/// ONNX backend configuration
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dimensions: usize,
    /// Token budget per input; longer inputs are truncated.
    pub max_tokens: usize,
}

/// Configuration union for the backend factory.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Onnx(OnnxConfig),
    OpenAi(OpenAiConfig),
    Hash { dimensions: usize },
}

impl BackendConfig {
    /// Select a backend from the `[embedding]` config section.
    ///
    /// The OpenAI API key is read from `RECALL_EMBEDDING_API_KEY`, falling back
    /// to `OPENAI_API_KEY`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        match config.backend.as_str() {
            "onnx" => {
                let (model_path, tokenizer_path) =
                    crate::onnx_embedder::resolve_onnx_paths(&config.onnx_model_path);
                Ok(BackendConfig::Onnx(OnnxConfig {
                    model_path,
                    tokenizer_path,
                    dimensions: config.onnx_dimensions,
                    max_tokens: config.onnx_max_tokens,
                }))
            }
            "openai" => {
                let api_key = std::env::var("RECALL_EMBEDDING_API_KEY")
                    .or_else(|_| std::env::var("OPENAI_API_KEY"))
                    .ok()
                    .filter(|k| !k.is_empty());
                Ok(BackendConfig::OpenAi(OpenAiConfig {
                    base_url: config.openai_base_url.trim_end_matches('/').to_string(),
                    api_key,
                    model: config.openai_model.clone(),
                    dimensions: config.openai_dimensions,
                    max_retries: config.max_retries,
                    retry_delay_ms: config.retry_delay_ms,
                    request_timeout: Duration::from_secs(config.request_timeout_seconds),
                }))
            }
            "hash" => Ok(BackendConfig::Hash {
                dimensions: config.hash_dimensions,
            }),
            other => Err(EmbeddingError::UnknownBackend(other.to_string())),
        }
    }
}

/// Create the appropriate backend from configuration.
pub fn create_backend(config: BackendConfig) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    match config {
        BackendConfig::Onnx(c) => Ok(Box::new(crate::onnx_embedder::OnnxEmbeddingClient::new(c)?)),
        BackendConfig::OpenAi(c) => Ok(Box::new(OpenAiEmbeddingClient::new(c)?)),
        BackendConfig::Hash { dimensions } => Ok(Box::new(
            crate::hash_embedder::HashEmbeddingClient::new(dimensions)?,
        )),
    }
}

// ============================================================================
// OpenAI-compatible API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiEmbeddingClient
// ============================================================================

/// Embedding client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingClient {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    /// Embed with retries. Client errors (bad key, unknown model) are not retried.
    pub async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(retry_strategy, move || async move {
            match self.embed_once(text).await {
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    // surfaced below without further attempts
                    Ok(Err(e))
                }
                Ok(v) => Ok(Ok(v)),
                Err(e) => {
                    tracing::warn!(error = %e, model = %self.config.model, "Embedding attempt failed");
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(e) => {
                tracing::error!(
                    attempts = self.config.max_retries + 1,
                    error = %e,
                    "All embedding retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.config.max_retries + 1,
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embeddings", self.config.base_url);

        let request = EmbeddingsRequest {
            model: &self.config.model,
            input: text,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Embedding API error");

            return Err(EmbeddingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingsResponse = response.json().await?;
        let values = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(EmbeddingError::MissingEmbedding)?;

        if values.len() != self.config.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_raw(text).await
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String, api_key: Option<&str>) -> OpenAiConfig {
        OpenAiConfig {
            base_url,
            api_key: api_key.map(str::to_string),
            model: "all-minilm".to_string(),
            dimensions: ONNX_DIMENSIONS,
            max_retries: 2,
            retry_delay_ms: 10,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn mock_embedding_response(dims: usize) -> serde_json::Value {
        let values: Vec<f32> = (0..dims).map(|i| (i as f32) / dims as f32).collect();
        serde_json::json!({
            "object": "list",
            "data": [{ "object": "embedding", "index": 0, "embedding": values }],
            "model": "all-minilm"
        })
    }

    #[tokio::test]
    async fn test_embed_calls_api_and_returns_vector() {
        let mock_server = MockServer::start().await;
        let client =
            OpenAiEmbeddingClient::new(test_config(mock_server.uri(), Some("sk-test"))).unwrap();

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(serde_json::json!({
                "model": "all-minilm",
                "input": "hello world"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response(384)))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello world").await.expect("embed failed");
        assert_eq!(embedding.len(), 384);
        assert_eq!(client.name(), "openai");
        assert_eq!(client.dimensions(), 384);
    }

    #[tokio::test]
    async fn test_embed_retries_on_503_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = OpenAiEmbeddingClient::new(test_config(mock_server.uri(), None)).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": { "message": "model loading" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response(384)))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello").await.expect("should succeed after retry");
        assert_eq!(embedding.len(), 384);
    }

    #[tokio::test]
    async fn test_embed_exhausts_retries_on_500() {
        let mock_server = MockServer::start().await;
        let client = OpenAiEmbeddingClient::new(test_config(mock_server.uri(), None)).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "boom" }
            })))
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(e @ EmbeddingError::RetryExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(e.kind(), ErrorKind::StoreUnavailable);
            }
            other => panic!("Expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embed_does_not_retry_on_401() {
        let mock_server = MockServer::start().await;
        let client = OpenAiEmbeddingClient::new(test_config(mock_server.uri(), None)).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": { "message": "invalid api key" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(e @ EmbeddingError::Api { code: 401, .. }) => {
                assert_eq!(e.kind(), ErrorKind::Configuration);
                assert!(e.to_string().contains("invalid api key"));
            }
            other => panic!("Expected Api 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embed_rejects_wrong_dimensions() {
        let mock_server = MockServer::start().await;
        let client = OpenAiEmbeddingClient::new(test_config(mock_server.uri(), None)).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_embedding_response(3)))
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(EmbeddingError::InvalidDimensions { expected, actual }) => {
                assert_eq!(expected, 384);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected InvalidDimensions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_text_without_calling_api() {
        let mock_server = MockServer::start().await;
        let client = OpenAiEmbeddingClient::new(test_config(mock_server.uri(), None)).unwrap();

        let err = client.embed("   ").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::EmptyInput));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let received = mock_server.received_requests().await.unwrap_or_default();
        assert!(received.is_empty());
    }

    #[test]
    fn test_backend_config_from_unknown_backend() {
        let config = EmbeddingConfig {
            backend: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        match BackendConfig::from_config(&config) {
            Err(EmbeddingError::UnknownBackend(name)) => assert_eq!(name, "word2vec"),
            other => panic!("Expected UnknownBackend, got {other:?}"),
        }
    }

    #[test]
    fn test_backend_config_hash() {
        let config = EmbeddingConfig {
            backend: "hash".to_string(),
            hash_dimensions: 64,
            ..EmbeddingConfig::default()
        };
        let backend = create_backend(BackendConfig::from_config(&config).unwrap()).unwrap();
        assert_eq!(backend.dimensions(), 64);
        assert_eq!(backend.name(), "hash");
    }
}
