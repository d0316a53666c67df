//! HTTP surface.
//!
//! Route groups and the rate budgets that gate them:
//!
//! - `GET /search` — semantic discovery (`search` limiter)
//! - `POST /services/{id}/call` — the call-dispatch pipeline (`call` limiter)
//! - `GET /services`, `GET /services/{id}`, `POST /services`,
//!   `GET /providers/{id}/stats`, `GET /activity` — catalog reads and
//!   registration (`registry` limiter)
//! - `GET /health` — unlimited

mod activity;
mod call;
mod search;
mod services;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router, middleware};

use crate::catalog::CatalogStore;
use crate::dispatch::Dispatcher;
use crate::embeddings::Embedder;
use crate::metrics::MetricsRecorder;
use crate::payment::PaymentGate;
use crate::ratelimit::{self, RateLimiter};
use crate::search::QueryRanker;

/// One limiter per route class, each an isolated keyspace.
#[derive(Clone, Debug)]
pub struct RouteLimiters {
    /// Discovery routes.
    pub search: Arc<RateLimiter>,
    /// Dispatch routes.
    pub call: Arc<RateLimiter>,
    /// Catalog read/registration routes.
    pub registry: Arc<RateLimiter>,
}

impl RouteLimiters {
    /// Builds the per-route limiters from configured budgets.
    #[must_use]
    pub fn new(limits: &crate::config::LimitsConfig) -> Self {
        Self {
            search: Arc::new(RateLimiter::new("search", limits.search)),
            call: Arc::new(RateLimiter::new("call", limits.call)),
            registry: Arc::new(RateLimiter::new("registry", limits.registry)),
        }
    }

    /// All limiters, for the maintenance sweep.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<RateLimiter>> {
        vec![
            Arc::clone(&self.search),
            Arc::clone(&self.call),
            Arc::clone(&self.registry),
        ]
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Catalog storage port.
    pub store: Arc<dyn CatalogStore>,
    /// Text-to-vector collaborator, used at registration time.
    pub embedder: Arc<dyn Embedder>,
    /// Semantic query ranker.
    pub ranker: Arc<QueryRanker>,
    /// Payment protocol engine.
    pub gate: Arc<PaymentGate>,
    /// Provider dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Call log recorder.
    pub metrics: Arc<MetricsRecorder>,
    /// Per-route rate limiters.
    pub limiters: RouteLimiters,
    /// Externally visible base URL for challenge resource URLs.
    pub public_base_url: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

/// Builds the gateway router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let search_routes = Router::new()
        .route("/search", get(search::search))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiters.search),
            ratelimit::enforce,
        ));

    let call_routes = Router::new()
        .route("/services/{id}/call", post(call::call_service))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiters.call),
            ratelimit::enforce,
        ));

    let registry_routes = Router::new()
        .route(
            "/services",
            get(services::list_services).post(services::register_service),
        )
        .route("/services/{id}", get(services::service_detail))
        .route("/providers/{id}/stats", get(services::provider_stats))
        .route("/activity", get(activity::recent_activity))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiters.registry),
            ratelimit::enforce,
        ));

    Router::new()
        .merge(search_routes)
        .merge(call_routes)
        .merge(registry_routes)
        .route("/health", get(health))
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
