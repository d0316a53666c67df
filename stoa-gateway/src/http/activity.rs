//! `GET /activity` — recent global call log, public.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub(super) struct ActivityParams {
    limit: Option<usize>,
}

/// Most recent marketplace calls, enriched with service names and
/// block-explorer links, capped at 50 rows.
pub(super) async fn recent_activity(
    State(state): State<AppState>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state
        .metrics
        .recent_activity(params.limit.unwrap_or(20))
        .await?;
    let count = entries.len();
    Ok(Json(json!({ "activity": entries, "count": count })))
}
