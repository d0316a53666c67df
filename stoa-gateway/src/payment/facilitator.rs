//! Facilitator client.
//!
//! The facilitator is the external service that verifies a caller's
//! payment assertion and executes settlement. The gateway talks to it
//! through the [`Facilitator`] trait; [`HttpFacilitator`] is the remote
//! implementation, speaking JSON over `POST ./verify`, `POST ./settle`,
//! and `GET ./supported` relative to a configured base URL.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::Client;
use stoa_proto::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};
use url::Url;

/// Errors that can occur while talking to a facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// HTTP transport error (connect failure, timeout, …).
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Unexpected HTTP status code.
    #[error("unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },

    /// JSON deserialization error.
    #[error("failed to deserialize JSON: {context}: {source}")]
    Json {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-HTTP implementations report failures through this variant.
    #[error("facilitator unavailable: {0}")]
    Unavailable(String),
}

/// Verifies and settles payment assertions.
///
/// Shared, long-lived, and safe for concurrent use by many in-flight
/// calls; implementations must not require per-call exclusive access.
#[async_trait]
pub trait Facilitator: Send + Sync + 'static {
    /// Verifies a payment assertion against its requirements.
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, FacilitatorError>;

    /// Executes settlement for a verified assertion.
    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, FacilitatorError>;

    /// Returns the facilitator's capability advertisement.
    async fn supported(&self) -> Result<SupportedResponse, FacilitatorError>;
}

/// A remote facilitator spoken to over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFacilitator {
    client: Client,
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    timeout: Duration,
}

impl HttpFacilitator {
    /// Constructs a client from a base URL, deriving the `./verify`,
    /// `./settle`, and `./supported` endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorError::UrlParse`] if endpoint derivation fails.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FacilitatorError> {
        // Normalize to a single trailing slash so join() appends.
        let mut normalized = base_url.trim_end_matches('/').to_owned();
        normalized.push('/');
        let base = Url::parse(&normalized).map_err(|e| FacilitatorError::UrlParse {
            context: "failed to parse base url",
            source: e,
        })?;
        let join = |segment: &str, context: &'static str| {
            base.join(segment)
                .map_err(|e| FacilitatorError::UrlParse { context, source: e })
        };
        Ok(Self {
            client: Client::new(),
            verify_url: join("./verify", "failed to construct ./verify URL")?,
            settle_url: join("./settle", "failed to construct ./settle URL")?,
            supported_url: join("./supported", "failed to construct ./supported URL")?,
            timeout,
        })
    }

    /// Sends one JSON request and decodes a JSON response.
    async fn round_trip<R>(
        &self,
        method: http::Method,
        url: &Url,
        context: &'static str,
        body: Option<&(impl serde::Serialize + Sync)>,
    ) -> Result<R, FacilitatorError>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut req = self
            .client
            .request(method, url.clone())
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| FacilitatorError::Http { context, source: e })?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FacilitatorError::HttpStatus {
                context,
                status,
                body,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| FacilitatorError::Json { context, source: e })
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, FacilitatorError> {
        self.round_trip(
            http::Method::POST,
            &self.verify_url,
            "POST /verify",
            Some(request),
        )
        .await
    }

    async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, FacilitatorError> {
        self.round_trip(
            http::Method::POST,
            &self.settle_url,
            "POST /settle",
            Some(request),
        )
        .await
    }

    async fn supported(&self) -> Result<SupportedResponse, FacilitatorError> {
        self.round_trip::<SupportedResponse>(
            http::Method::GET,
            &self.supported_url,
            "GET /supported",
            None::<&()>,
        )
        .await
    }
}
