//! Operator-facing usage introspection, behind the internal shared secret.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// `GET /internal/usage?limit=N` — recent usage events plus aggregates.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> impl IntoResponse {
    let entries = state.usage.recent(query.limit).await;
    let stats = state.usage.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}
