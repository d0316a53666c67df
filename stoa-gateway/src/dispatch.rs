//! Provider endpoint dispatcher.
//!
//! Forwards a verified, settled call to the provider's real endpoint with
//! a bounded timeout. Failures are data, not exceptions: every outcome —
//! timeout, transport failure, provider error status — comes back as a
//! [`DispatchOutcome`] so the pipeline can always proceed to the metrics
//! recorder.
//!
//! No automatic retries: a provider is paid once per call, and retrying
//! would risk double execution without re-proving payment. A retry is a
//! new call with a new payment cycle.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;

/// Why a dispatch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchFailure {
    /// The provider did not answer within the timeout.
    #[error("provider timed out")]
    Timeout,

    /// The provider endpoint could not be reached.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}")]
    Status {
        /// The provider's HTTP status.
        status: u16,
        /// The provider's response body, as text.
        body: String,
    },

    /// The provider answered 2xx but the body was not JSON.
    #[error("provider returned a non-JSON body: {0}")]
    BadPayload(String),
}

impl DispatchFailure {
    /// Whether this failure is a caller-side provider error (4xx), which
    /// the gateway forwards as-is rather than masking as a gateway fault.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status >= 400 && *status < 500)
    }
}

/// The result of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Wall-clock time spent on the attempt, in milliseconds.
    pub latency_ms: u64,
    /// The provider's JSON body on success, or the typed failure.
    pub result: Result<Value, DispatchFailure>,
}

impl DispatchOutcome {
    /// Whether the provider answered successfully.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.result.is_ok()
    }

    /// The failure message recorded in the call log, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}

/// Dispatches calls to provider endpoints.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with the given (finite) timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// POSTs `body` to the provider endpoint and captures the outcome.
    ///
    /// Never returns an error: the outcome carries failures as data.
    pub async fn forward(&self, endpoint_url: &str, body: Vec<u8>) -> DispatchOutcome {
        let started = Instant::now();
        let response = self
            .client
            .post(endpoint_url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let failure = if err.is_timeout() {
                    DispatchFailure::Timeout
                } else {
                    DispatchFailure::Unreachable(err.to_string())
                };
                tracing::warn!(endpoint = %endpoint_url, latency_ms, error = %failure, "dispatch failed");
                return DispatchOutcome {
                    latency_ms,
                    result: Err(failure),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let latency_ms = started.elapsed().as_millis() as u64;
            return DispatchOutcome {
                latency_ms,
                result: Err(DispatchFailure::Status {
                    status: status.as_u16(),
                    body,
                }),
            };
        }

        let parsed = response.json::<Value>().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        DispatchOutcome {
            latency_ms,
            result: parsed.map_err(|e| DispatchFailure::BadPayload(e.to_string())),
        }
    }
}
