//! Liveness probe endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /healthz` — always 200 with status and uptime.
///
/// No downstream dependencies and never blocks, so it is safe as a Docker /
/// Kubernetes liveness probe.
pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_secs": state.started_at.elapsed().as_secs(),
        })),
    )
}
