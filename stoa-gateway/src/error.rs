//! Gateway error taxonomy.
//!
//! Protocol-expected states (payment challenges, rate limiting) are
//! structured responses, never process failures. Settlement-after-
//! verification failures carry the settlement reference (or an explicit
//! absence) so money movement without a delivered call is always visible
//! for manual reconciliation.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced by the gateway's HTTP pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid caller identity.
    #[error("{0}")]
    Auth(&'static str),

    /// Caller exceeded a rate budget; retryable after the window resets.
    #[error("too many requests")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
        /// The budget that was exceeded.
        limit: u32,
    },

    /// A filter value is outside the enumerated category/kind sets.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Malformed request input (bad id, bad body, bad header).
    #[error("{0}")]
    InvalidRequest(String),

    /// The embedding collaborator failed; discovery is unavailable.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(#[source] crate::embeddings::EmbedError),

    /// The facilitator declined the payment assertion.
    #[error("payment verification failed: {reason}")]
    PaymentRejected {
        /// Facilitator's machine-readable reason.
        reason: String,
        /// Payer address, if identified before rejection.
        payer: Option<String>,
    },

    /// Verification succeeded but settlement did not.
    #[error("settlement failed: {reason}")]
    SettlementFailed {
        /// Facilitator's machine-readable reason.
        reason: String,
        /// Human-readable detail, if any.
        message: Option<String>,
    },

    /// The facilitator could not be reached or answered out of protocol.
    #[error("payment system unavailable")]
    FacilitatorUnavailable(#[source] crate::payment::FacilitatorError),

    /// Provider did not answer within the dispatch timeout. Settlement may
    /// already have completed; `tx_hash` is retained for reconciliation.
    #[error("provider timed out after {latency_ms}ms")]
    ProviderTimeout {
        /// Time spent waiting, in milliseconds.
        latency_ms: u64,
        /// Settlement reference, when payment already settled.
        tx_hash: Option<String>,
    },

    /// Provider was unreachable or returned a server error after
    /// settlement; `tx_hash` is retained for reconciliation.
    #[error("provider error: {detail}")]
    ProviderError {
        /// What went wrong.
        detail: String,
        /// Settlement reference, when payment already settled.
        tx_hash: Option<String>,
    },

    /// An embedding vector did not match the configured dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    SchemaMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length actually produced.
        got: usize,
    },

    /// The requested row does not exist (or is inactive).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Storage-layer failure.
    #[error("storage error")]
    Store(#[from] crate::catalog::StoreError),
}

impl ApiError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidFilter(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::DiscoveryUnavailable(_) | Self::FacilitatorUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::PaymentRejected { .. } => StatusCode::FORBIDDEN,
            Self::SettlementFailed { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ProviderTimeout { .. } | Self::ProviderError { .. } => StatusCode::BAD_GATEWAY,
            Self::SchemaMismatch { .. } | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.to_string() });

        match &self {
            Self::RateLimited {
                retry_after_secs, ..
            } => {
                body["retryAfter"] = json!(retry_after_secs);
            }
            Self::PaymentRejected { reason, payer } => {
                body["reason"] = json!(reason);
                if let Some(payer) = payer {
                    body["payer"] = json!(payer);
                }
            }
            Self::SettlementFailed { message, .. } => {
                if let Some(message) = message {
                    body["details"] = json!(message);
                }
            }
            Self::ProviderTimeout { tx_hash, .. } | Self::ProviderError { tx_hash, .. } => {
                body["txHash"] = json!(tx_hash);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
