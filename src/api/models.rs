//! Public model listing.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /models` — active catalog models with capability metadata.
///
/// Deprecated models are omitted. The listing is public: per-tier access is
/// enforced at chat time, not here.
pub async fn list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.catalog.snapshot().await;
    let data: Vec<_> = snapshot
        .models()
        .iter()
        .filter(|m| !m.deprecated)
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "display_name": m.display_name,
                "input_modalities": m.input_modalities,
                "output_modalities": m.output_modalities,
                "context_window": m.context_window,
                "max_output_tokens": m.max_output_tokens,
                "pricing": {
                    "per_k_input": m.price_per_k_input,
                    "per_k_output": m.price_per_k_output,
                },
                "supports_reasoning": m.supports_reasoning,
                "free": m.free_variant,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}
