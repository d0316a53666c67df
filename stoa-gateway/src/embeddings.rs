//! Text-to-vector collaborator.
//!
//! The gateway never computes embeddings itself; it consumes an external
//! feature-extraction endpoint through the [`Embedder`] trait. The HTTP
//! implementation posts `{"inputs": text}` and accepts either a flat
//! vector or a batch-of-one response shape.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Errors from the embedding collaborator.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// HTTP transport error.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Unexpected HTTP status code.
    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },

    /// The response body was not a recognizable vector.
    #[error("failed to decode embedding response: {0}")]
    Decode(String),

    /// The produced vector has the wrong length.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length actually produced.
        got: usize,
    },
}

/// Produces a fixed-length vector for a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    /// Embeds `text`, returning a vector of the configured dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// The vector length this embedder is configured to produce.
    fn dimensions(&self) -> usize;
}

/// Joins the fields a service is ranked on into one embedding input.
#[must_use]
pub fn service_embedding_text(name: &str, description: &str, capabilities: &[String]) -> String {
    let mut text = String::with_capacity(name.len() + description.len() + 32);
    text.push_str(name);
    text.push(' ');
    text.push_str(description);
    for capability in capabilities {
        text.push(' ');
        text.push_str(capability);
    }
    text
}

/// Feature-extraction responses come back either flat (`[0.1, ...]`) or as
/// a batch of one (`[[0.1, ...]]`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Flat(Vec<f32>),
    Batch(Vec<Vec<f32>>),
}

/// HTTP client for a feature-extraction endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    url: Url,
    auth_token: Option<String>,
    dimensions: usize,
    timeout: Duration,
}

impl HttpEmbedder {
    /// Creates a client for the given endpoint.
    pub fn new(url: Url, dimensions: usize, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            auth_token: None,
            dimensions,
            timeout,
        }
    }

    /// Attaches a bearer token to all future requests.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Builds a client from the gateway configuration.
    ///
    /// # Errors
    ///
    /// Fails when the configured URL does not parse.
    pub fn from_config(config: &crate::config::EmbeddingsConfig) -> Result<Self, url::ParseError> {
        let url = Url::parse(&config.url)?;
        let mut embedder = Self::new(
            url,
            config.dimensions,
            Duration::from_secs(config.timeout_secs),
        );
        if let Some(token) = &config.auth_token {
            // Unresolved $VAR placeholders mean the secret is absent.
            if !token.is_empty() && !token.starts_with('$') {
                embedder = embedder.with_auth_token(token.clone());
            }
        }
        Ok(embedder)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut req = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&serde_json::json!({ "inputs": text }));
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| EmbedError::Http {
            context: "POST feature-extraction",
            source: e,
        })?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::HttpStatus { status, body });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Decode(e.to_string()))?;

        let vector = match parsed {
            EmbeddingResponse::Flat(v) => v,
            EmbeddingResponse::Batch(mut batch) => {
                if batch.is_empty() {
                    return Err(EmbedError::Decode("empty batch response".into()));
                }
                batch.swap_remove(0)
            }
        };

        if vector.len() != self.dimensions {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
