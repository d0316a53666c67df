//! Catalog routes: listing, detail, registration, and provider stats.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use crate::auth::resolve_caller;
use crate::catalog::{
    Category, ListOptions, Service, ServiceKind, ServiceSort, ServiceStats, now_millis,
};
use crate::embeddings::{EmbedError, service_embedding_text};
use crate::error::ApiError;
use stoa_proto::UsdcAmount;

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    category: Option<String>,
    kind: Option<String>,
    sort: Option<ServiceSort>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// `GET /services` — list active services.
pub(super) async fn list_services(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let category = parse_filter::<Category>(params.category.as_deref(), &Category::ALL)?;
    let kind = parse_filter::<ServiceKind>(params.kind.as_deref(), &ServiceKind::ALL)?;

    let services = state
        .store
        .list_services(ListOptions {
            category,
            kind,
            owner_id: None,
            sort: params.sort.unwrap_or_default(),
            limit: params.limit.unwrap_or(20).clamp(1, 100),
            offset: params.offset.unwrap_or(0),
        })
        .await?;
    let count = services.len();
    Ok(Json(json!({ "services": services, "count": count })))
}

/// `GET /services/{id}` — service detail with its recent calls.
pub(super) async fn service_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("service"))?;
    let service = state
        .store
        .service(id)
        .await?
        .ok_or(ApiError::NotFound("service"))?;
    let recent_calls = state.metrics.service_calls(id, 10).await?;
    Ok(Json(json!({ "service": service, "recentCalls": recent_calls })))
}

/// `GET /providers/{id}/stats` — aggregate earnings for one owner.
pub(super) async fn provider_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("provider"))?;
    let stats = state.metrics.owner_stats(id).await?;
    Ok(Json(json!({
        "totalServices": stats.total_services,
        "totalCalls": stats.total_calls,
        "totalEarningsUsdc": stats.total_earnings.to_decimal(),
    })))
}

/// Registration payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RegisterService {
    owner_address: String,
    name: String,
    description: String,
    capabilities: Vec<String>,
    category: Category,
    #[serde(default = "default_kind")]
    service_type: ServiceKind,
    price_usdc_per_call: Decimal,
    endpoint_url: String,
    input_schema: Value,
    output_schema: Value,
}

const fn default_kind() -> ServiceKind {
    ServiceKind::MlModel
}

/// `POST /services` — register a new service.
///
/// Generates the ranking embedding from name + description + capabilities
/// via the external embedder; a caller presenting a valid `X-Stoa-Key`
/// becomes the owning account.
pub(super) async fn register_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterService>,
) -> Result<Response, ApiError> {
    validate_registration(&body)?;

    let price = UsdcAmount::from_decimal(body.price_usdc_per_call)
        .map_err(|e| ApiError::InvalidRequest(format!("priceUsdcPerCall: {e}")))?;
    url::Url::parse(&body.endpoint_url)
        .map_err(|_| ApiError::InvalidRequest("endpointUrl must be a valid URL".to_owned()))?;

    // Link to the caller when a key is presented; anonymous otherwise.
    let owner_id = match resolve_caller(state.store.as_ref(), &headers).await {
        Ok(caller) => Some(caller.id),
        Err(ApiError::Auth(_)) => None,
        Err(err) => return Err(err),
    };

    let text = service_embedding_text(&body.name, &body.description, &body.capabilities);
    let embedding = state.embedder.embed(&text).await.map_err(|e| match e {
        EmbedError::DimensionMismatch { expected, got } => {
            ApiError::SchemaMismatch { expected, got }
        }
        other => ApiError::DiscoveryUnavailable(other),
    })?;

    let now = now_millis();
    let service = Service {
        id: Uuid::new_v4(),
        owner_address: body.owner_address,
        owner_id,
        name: body.name,
        description: body.description,
        capabilities: body.capabilities,
        category: body.category,
        kind: body.service_type,
        price,
        endpoint_url: body.endpoint_url,
        input_schema: body.input_schema,
        output_schema: body.output_schema,
        embedding,
        stats: ServiceStats::default(),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    let id = service.id;
    let response = json!({ "service": &service });
    state.store.insert_service(service).await?;

    tracing::info!(service = %id, "registered service");
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

fn validate_registration(body: &RegisterService) -> Result<(), ApiError> {
    if body.owner_address.is_empty() {
        return Err(ApiError::InvalidRequest(
            "ownerAddress must not be empty".to_owned(),
        ));
    }
    if body.name.is_empty() || body.name.len() > 100 {
        return Err(ApiError::InvalidRequest(
            "name must be 1-100 characters".to_owned(),
        ));
    }
    if body.description.len() < 10 || body.description.len() > 2000 {
        return Err(ApiError::InvalidRequest(
            "description must be 10-2000 characters".to_owned(),
        ));
    }
    if body.capabilities.is_empty() {
        return Err(ApiError::InvalidRequest(
            "at least one capability is required".to_owned(),
        ));
    }
    Ok(())
}

fn parse_filter<T: std::str::FromStr>(
    value: Option<&str>,
    valid: &[&str],
) -> Result<Option<T>, ApiError> {
    value
        .map(str::parse::<T>)
        .transpose()
        .map_err(|_| ApiError::InvalidFilter(format!("must be one of: {}", valid.join(", "))))
}

#[cfg(test)]
mod tests {
    use crate::catalog::fixtures::service;
    use crate::catalog::CatalogStore;
    use crate::http::router;
    use crate::http::testutil::test_app;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn registration() -> serde_json::Value {
        serde_json::json!({
            "ownerAddress": "0xOwner",
            "name": "Chest X-Ray Analysis",
            "description": "Detects anomalies in chest radiographs",
            "capabilities": ["radiology", "triage"],
            "category": "medical",
            "serviceType": "ml-model",
            "priceUsdcPerCall": 0.05,
            "endpointUrl": "https://provider.example/run",
            "inputSchema": { "type": "object" },
            "outputSchema": { "type": "object" }
        })
    }

    fn post_registration(body: serde_json::Value) -> Request<Body> {
        Request::post("/services")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn registers_and_lists_a_service() {
        let test = test_app("http://127.0.0.1:1");
        let app = router(test.state);

        let response = app
            .clone()
            .oneshot(post_registration(registration()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["service"]["name"], "Chest X-Ray Analysis");
        assert_eq!(created["service"]["price"], "50000");
        // the embedding never leaves the server
        assert!(created["service"].get("embedding").is_none());

        let response = app
            .oneshot(Request::get("/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["count"], 1);

        // the stored row carries the embedder's vector
        let stored = test.store.active_services().await.unwrap();
        assert_eq!(stored[0].embedding, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn rejects_invalid_registrations() {
        let test = test_app("http://127.0.0.1:1");
        let app = router(test.state);

        let mut short_description = registration();
        short_description["description"] = serde_json::json!("too short");
        let response = app
            .clone()
            .oneshot(post_registration(short_description))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut bad_category = registration();
        bad_category["category"] = serde_json::json!("astrology");
        let response = app
            .clone()
            .oneshot(post_registration(bad_category))
            .await
            .unwrap();
        // unknown enum member fails body deserialization
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut negative_price = registration();
        negative_price["priceUsdcPerCall"] = serde_json::json!(-0.01);
        let response = app
            .oneshot(post_registration(negative_price))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detail_includes_recent_calls() {
        let test = test_app("http://127.0.0.1:1");
        let row = service("detail", 0);
        let id = row.id;
        test.store.insert_service(row).await.unwrap();
        let app = router(test.state);

        let response = app
            .oneshot(
                Request::get(format!("/services/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"]["name"], "detail");
        assert_eq!(json["recentCalls"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn provider_stats_roll_up_owned_services() {
        let test = test_app("http://127.0.0.1:1");
        let owner = uuid::Uuid::new_v4();
        let mut row = service("owned", 50_000);
        row.owner_id = Some(owner);
        row.stats.total_calls = 3;
        test.store.insert_service(row).await.unwrap();
        let app = router(test.state);

        let response = app
            .oneshot(
                Request::get(format!("/providers/{owner}/stats"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["totalServices"], 1);
        assert_eq!(json["totalCalls"], 3);
    }
}
