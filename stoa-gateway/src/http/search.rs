//! `GET /search` — semantic service discovery.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::catalog::{Category, ServiceKind};
use crate::error::ApiError;
use crate::search::{DEFAULT_RESULTS, SearchError, SearchFilters};

/// Longest accepted query string.
const MAX_QUERY_LEN: usize = 500;

#[derive(Debug, Deserialize)]
pub(super) struct SearchParams {
    query: String,
    category: Option<String>,
    kind: Option<String>,
    limit: Option<usize>,
}

/// Ranks active services against a natural-language query.
pub(super) async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = params.query.trim();
    if query.is_empty() || query.len() > MAX_QUERY_LEN {
        return Err(ApiError::InvalidRequest(format!(
            "query must be 1-{MAX_QUERY_LEN} characters"
        )));
    }

    let category = params
        .category
        .as_deref()
        .map(str::parse::<Category>)
        .transpose()
        .map_err(|_| {
            ApiError::InvalidFilter(format!(
                "category must be one of: {}",
                Category::ALL.join(", ")
            ))
        })?;
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<ServiceKind>)
        .transpose()
        .map_err(|_| {
            ApiError::InvalidFilter(format!(
                "kind must be one of: {}",
                ServiceKind::ALL.join(", ")
            ))
        })?;

    let hits = state
        .ranker
        .rank(
            query,
            SearchFilters { category, kind },
            params.limit.unwrap_or(DEFAULT_RESULTS),
        )
        .await
        .map_err(|err| match err {
            SearchError::DiscoveryUnavailable(source) => ApiError::DiscoveryUnavailable(source),
            SearchError::Store(source) => ApiError::Store(source),
        })?;

    let total = hits.len();
    Ok(Json(json!({
        "services": hits,
        "query": query,
        "totalCount": total,
    })))
}
