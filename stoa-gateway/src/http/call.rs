//! `POST /services/{id}/call` — the call-dispatch pipeline.
//!
//! Order of operations for one call: rate gate (router layer) → caller
//! resolution → service lookup → payment gate → dispatch → metrics.
//! Settlement strictly precedes dispatch; dispatch strictly precedes the
//! metrics update. A settled call that then fails dispatch is recorded
//! with its settlement reference so operators can reconcile it by hand —
//! the gateway never reverses settlement on its own.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use crate::auth::resolve_caller;
use crate::catalog::{Caller, Service};
use crate::dispatch::{DispatchFailure, DispatchOutcome};
use crate::error::ApiError;
use crate::metrics::CallRecord;
use crate::payment::{PaymentError, SettledPayment};
use stoa_proto::UsdcAmount;
use stoa_proto::encoding::decode_payment_header;

/// Header carrying the caller's payment assertion.
const PAYMENT_HEADER: &str = "X-PAYMENT";

pub(super) async fn call_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let service_id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("service"))?;

    let caller = resolve_caller(state.store.as_ref(), &headers).await?;

    let service = state
        .store
        .service(service_id)
        .await?
        .filter(|s| s.is_active)
        .ok_or(ApiError::NotFound("service"))?;

    // Free services skip the payment exchange entirely.
    if service.price.is_zero() {
        return dispatch_and_record(&state, &service, &caller, None, body).await;
    }

    let Some(header_value) = headers.get(PAYMENT_HEADER).and_then(|v| v.to_str().ok()) else {
        let resource_url = resource_url(&state, &headers, service_id);
        let challenge = state.gate.challenge(&service, &resource_url);
        tracing::debug!(service = %service_id, "issued payment challenge");
        return Ok((StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response());
    };

    let payload = decode_payment_header(header_value)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid payment header: {e}")))?;

    let settled = match state.gate.collect(&service, payload).await {
        Ok(settled) => settled,
        Err(err) => return Err(payment_failure(&state, &service, &caller, err).await),
    };

    dispatch_and_record(&state, &service, &caller, Some(settled), body).await
}

/// Builds the resource URL embedded in a challenge: the configured public
/// base, or the request's `Host` header as a fallback.
fn resource_url(state: &AppState, headers: &HeaderMap, service_id: Uuid) -> String {
    let base = state.public_base_url.clone().unwrap_or_else(|| {
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    });
    format!("{}/services/{service_id}/call", base.trim_end_matches('/'))
}

/// Maps a payment failure to its API error, logging the call when money
/// may have moved.
async fn payment_failure(
    state: &AppState,
    service: &Service,
    caller: &Caller,
    err: PaymentError,
) -> ApiError {
    match err {
        PaymentError::Rejected { reason, payer } => {
            // Nothing was charged and nothing dispatched; no log row.
            ApiError::PaymentRejected { reason, payer }
        }
        PaymentError::Settlement { reason, message } => {
            // Verified but not settled: record the failed attempt with an
            // explicit absent settlement reference.
            record_or_warn(
                state,
                CallRecord {
                    service_id: service.id,
                    caller_id: Some(caller.id),
                    caller_address: caller_address(caller),
                    cost: UsdcAmount::ZERO,
                    success: false,
                    latency_ms: 0,
                    tx_hash: None,
                    error_message: Some(format!("settlement failed: {reason}")),
                },
            )
            .await;
            ApiError::SettlementFailed { reason, message }
        }
        PaymentError::Transport { step, source } => {
            if step == "settle" {
                // The settlement outcome is unknown — money may have moved.
                record_or_warn(
                    state,
                    CallRecord {
                        service_id: service.id,
                        caller_id: Some(caller.id),
                        caller_address: caller_address(caller),
                        cost: UsdcAmount::ZERO,
                        success: false,
                        latency_ms: 0,
                        tx_hash: None,
                        error_message: Some(format!(
                            "settlement outcome unknown: {source}"
                        )),
                    },
                )
                .await;
            }
            ApiError::FacilitatorUnavailable(source)
        }
        PaymentError::IllegalTransition { from, to } => {
            tracing::error!(?from, ?to, "payment flow bug: illegal transition");
            ApiError::InvalidRequest("payment flow error".to_owned())
        }
    }
}

/// Forwards the call to the provider, records the outcome, and shapes the
/// caller-facing response.
async fn dispatch_and_record(
    state: &AppState,
    service: &Service,
    caller: &Caller,
    settled: Option<SettledPayment>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let outcome = state
        .dispatcher
        .forward(&service.endpoint_url, body.to_vec())
        .await;

    let (cost, tx_hash, caller_address) = match &settled {
        Some(settled) => (
            settled.amount,
            Some(settled.tx_hash.clone()),
            settled.payer.clone(),
        ),
        None => (UsdcAmount::ZERO, None, "free".to_owned()),
    };

    record_or_warn(
        state,
        CallRecord {
            service_id: service.id,
            caller_id: Some(caller.id),
            caller_address,
            cost,
            success: outcome.success(),
            latency_ms: outcome.latency_ms,
            tx_hash: tx_hash.clone(),
            error_message: outcome.error_message(),
        },
    )
    .await;

    respond(state, &outcome, cost, tx_hash)
}

fn caller_address(caller: &Caller) -> String {
    caller
        .wallet_address
        .clone()
        .unwrap_or_else(|| "unknown".to_owned())
}

async fn record_or_warn(state: &AppState, record: CallRecord) {
    // A recording failure must not turn a delivered call into an error.
    if let Err(err) = state.metrics.record(record).await {
        tracing::warn!(error = %err, "failed to record call outcome");
    }
}

fn respond(
    state: &AppState,
    outcome: &DispatchOutcome,
    cost: UsdcAmount,
    tx_hash: Option<String>,
) -> Result<Response, ApiError> {
    match &outcome.result {
        Ok(result) => {
            let mut body = json!({
                "result": result,
                "costUsdc": cost.to_decimal(),
                "latencyMs": outcome.latency_ms,
            });
            if let Some(tx) = &tx_hash {
                body["txHash"] = json!(tx);
                body["explorerUrl"] = json!(state.metrics.explorer_url(tx));
            } else {
                body["free"] = json!(true);
            }
            Ok(Json(body).into_response())
        }
        Err(failure) if failure.is_client_error() => {
            // Forward provider 4xx as-is; the caller's input was at fault.
            let DispatchFailure::Status { status, body } = failure else {
                unreachable!("is_client_error implies Status");
            };
            let status =
                StatusCode::from_u16(*status).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
            Ok((status, body.clone()).into_response())
        }
        Err(DispatchFailure::Timeout) => Err(ApiError::ProviderTimeout {
            latency_ms: outcome.latency_ms,
            tx_hash,
        }),
        Err(failure) => Err(ApiError::ProviderError {
            detail: failure.to_string(),
            tx_hash,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_api_key;
    use crate::catalog::fixtures::service;
    use crate::catalog::{CatalogStore, MemoryCatalog};
    use crate::http::router;
    use crate::http::testutil::test_app;
    use axum::body::Body;
    use http::Request;
    use std::sync::Arc;
    use stoa_proto::encoding::encode_payment_header;
    use stoa_proto::{PaymentPayload, PaymentRequired, SettleResponse, VerifyResponse};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API_KEY: &str = "sk_live_agent7";

    async fn seed_caller(store: &MemoryCatalog) -> Caller {
        let caller = Caller {
            id: Uuid::new_v4(),
            display_name: Some("agent-7".into()),
            wallet_address: Some("0xCallerWallet".into()),
            api_key_hash: hash_api_key(API_KEY),
        };
        store.insert_caller(caller.clone()).await.unwrap();
        caller
    }

    async fn seed_service(store: &MemoryCatalog, endpoint: &str, price_micros: u64) -> Uuid {
        let mut row = service("Chest X-Ray Analysis", price_micros);
        row.endpoint_url = endpoint.to_owned();
        let id = row.id;
        store.insert_service(row).await.unwrap();
        id
    }

    async fn mount_provider(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "finding": "no anomaly" })),
            )
            .mount(server)
            .await;
    }

    async fn mount_facilitator(server: &MockServer, verify_ok: bool, settle_ok: bool) {
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(stoa_proto::SupportedResponse::default()),
            )
            .mount(server)
            .await;
        let verify = if verify_ok {
            VerifyResponse::valid("0xPayer")
        } else {
            VerifyResponse::invalid("insufficient_funds", "balance too low")
        };
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(verify))
            .mount(server)
            .await;
        let settle = if settle_ok {
            SettleResponse::success("0xtx1", "eip155:84532", "0xPayer")
        } else {
            SettleResponse::error("transfer_reverted", "authorization expired", "eip155:84532")
        };
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(settle))
            .mount(server)
            .await;
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn call_request(id: Uuid, payment: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(format!("/services/{id}/call"))
            .header("X-Stoa-Key", API_KEY)
            .header("content-type", "application/json");
        if let Some(payment) = payment {
            builder = builder.header("X-PAYMENT", payment);
        }
        builder
            .body(Body::from(r#"{"image":"..."}"#))
            .unwrap()
    }

    /// Answers a 402 challenge the way a paying caller SDK would.
    fn assertion_for(challenge: &serde_json::Value) -> String {
        let challenge: PaymentRequired = serde_json::from_value(challenge.clone()).unwrap();
        let payload = PaymentPayload {
            x402_version: stoa_proto::X402_VERSION,
            payload: serde_json::json!({ "signature": "0xsig" }),
            accepted: challenge.accepts[0].clone(),
        };
        encode_payment_header(&payload).unwrap()
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let test = test_app("http://127.0.0.1:1");
        let id = seed_service(&test.store, "http://127.0.0.1:1/run", 0).await;
        let app = router(test.state);

        let response = app
            .oneshot(
                Request::post(format!("/services/{id}/call"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_or_malformed_service_id_is_not_found() {
        let test = test_app("http://127.0.0.1:1");
        seed_caller(&test.store).await;
        let app = router(test.state);

        let response = app
            .clone()
            .oneshot(call_request(Uuid::new_v4(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/services/not-a-uuid/call")
                    .header("X-Stoa-Key", API_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn free_service_dispatches_without_payment() {
        let provider = MockServer::start().await;
        mount_provider(&provider).await;
        let test = test_app("http://127.0.0.1:1");
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 0).await;
        let store = Arc::clone(&test.store);
        let app = router(test.state);

        let response = app.oneshot(call_request(id, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["result"]["finding"], "no anomaly");
        assert_eq!(json["free"], true);
        assert_eq!(json["costUsdc"], serde_json::json!(0.0));

        let logs = store.recent_calls(1).await.unwrap();
        assert!(logs[0].success);
        assert!(logs[0].cost.is_zero());
        assert_eq!(logs[0].caller_address, "free");
    }

    #[tokio::test]
    async fn paid_flow_challenges_then_settles_and_dispatches() {
        let provider = MockServer::start().await;
        mount_provider(&provider).await;
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, true, true).await;

        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 50_000).await;
        let store = Arc::clone(&test.store);
        let app = router(test.state);

        // 1. no payment header → 402 challenge with exact price + resource
        let response = app
            .clone()
            .oneshot(call_request(id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let challenge = body_json(response).await;
        assert_eq!(challenge["accepts"][0]["amount"], "50000");
        assert_eq!(
            challenge["resource"]["url"],
            format!("https://gateway.test/services/{id}/call")
        );

        // 2. retry with an assertion → verified, settled, dispatched
        let header = assertion_for(&challenge);
        let response = app.oneshot(call_request(id, Some(&header))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["result"]["finding"], "no anomaly");
        assert_eq!(json["costUsdc"], serde_json::json!(0.05));
        assert_eq!(json["txHash"], "0xtx1");
        assert_eq!(
            json["explorerUrl"],
            "https://sepolia.basescan.org/tx/0xtx1"
        );

        let logs = store.recent_calls(1).await.unwrap();
        assert!(logs[0].success);
        assert_eq!(logs[0].cost.as_micros(), 50_000);
        assert_eq!(logs[0].tx_hash.as_deref(), Some("0xtx1"));

        let row = store.service(id).await.unwrap().unwrap();
        assert_eq!(row.stats.total_calls, 1);
    }

    #[tokio::test]
    async fn rejected_verification_neither_dispatches_nor_charges() {
        let provider = MockServer::start().await;
        mount_provider(&provider).await;
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, false, true).await;

        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 50_000).await;
        let store = Arc::clone(&test.store);
        let app = router(test.state);

        let challenge = body_json(
            app.clone()
                .oneshot(call_request(id, None))
                .await
                .unwrap(),
        )
        .await;
        let header = assertion_for(&challenge);
        let response = app.oneshot(call_request(id, Some(&header))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["reason"], "insufficient_funds");

        // no dispatch happened, nothing recorded as charged
        assert_eq!(provider.received_requests().await.unwrap().len(), 0);
        assert!(store.recent_calls(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settlement_failure_is_logged_and_surfaced() {
        let provider = MockServer::start().await;
        mount_provider(&provider).await;
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, true, false).await;

        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 50_000).await;
        let store = Arc::clone(&test.store);
        let app = router(test.state);

        let challenge = body_json(
            app.clone()
                .oneshot(call_request(id, None))
                .await
                .unwrap(),
        )
        .await;
        let header = assertion_for(&challenge);
        let response = app.oneshot(call_request(id, Some(&header))).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        assert_eq!(provider.received_requests().await.unwrap().len(), 0);
        let logs = store.recent_calls(1).await.unwrap();
        assert!(!logs[0].success);
        assert!(logs[0].cost.is_zero());
        assert!(
            logs[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("settlement failed")
        );
    }

    #[tokio::test]
    async fn settled_call_with_dead_provider_keeps_the_tx_hash() {
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, true, true).await;

        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        // nothing listens here
        let id = seed_service(&test.store, "http://127.0.0.1:1/run", 50_000).await;
        let store = Arc::clone(&test.store);
        let app = router(test.state);

        let challenge = body_json(
            app.clone()
                .oneshot(call_request(id, None))
                .await
                .unwrap(),
        )
        .await;
        let header = assertion_for(&challenge);
        let response = app.oneshot(call_request(id, Some(&header))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["txHash"], "0xtx1");

        let logs = store.recent_calls(1).await.unwrap();
        assert!(!logs[0].success);
        assert_eq!(logs[0].tx_hash.as_deref(), Some("0xtx1"));
        // the failed call still feeds the aggregates
        let row = store.service(id).await.unwrap().unwrap();
        assert_eq!(row.stats.total_calls, 1);
    }

    #[tokio::test]
    async fn replayed_assertion_is_rejected() {
        let provider = MockServer::start().await;
        mount_provider(&provider).await;
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, true, true).await;

        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 50_000).await;
        let app = router(test.state);

        let challenge = body_json(
            app.clone()
                .oneshot(call_request(id, None))
                .await
                .unwrap(),
        )
        .await;
        let header = assertion_for(&challenge);
        let first = app
            .clone()
            .oneshot(call_request(id, Some(&header)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(call_request(id, Some(&header))).await.unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        let json = body_json(second).await;
        assert_eq!(json["reason"], "nonce_already_settled");
    }

    #[tokio::test]
    async fn provider_4xx_is_forwarded_as_is() {
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad input shape"))
            .mount(&provider)
            .await;

        let test = test_app("http://127.0.0.1:1");
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, &format!("{}/run", provider.uri()), 0).await;
        let app = router(test.state);

        let response = app.oneshot(call_request(id, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"bad input shape");
    }

    #[tokio::test]
    async fn garbled_payment_header_is_bad_request() {
        let facilitator = MockServer::start().await;
        mount_facilitator(&facilitator, true, true).await;
        let test = test_app(&facilitator.uri());
        seed_caller(&test.store).await;
        let id = seed_service(&test.store, "http://127.0.0.1:1/run", 50_000).await;
        let app = router(test.state);

        let response = app
            .oneshot(call_request(id, Some("!!not-base64!!")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
