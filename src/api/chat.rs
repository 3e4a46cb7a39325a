//! Chat endpoints — buffered and streaming execution plus the persistence
//! callback surface.
//!
//! Execution path: validate (downgrade, gate, budget) → resolve attachments
//! → forward to Router → shape the response. Buffered calls return the JSON
//! contract body; streaming calls hand the upstream SSE bytes to the
//! [`StreamTransformer`] and return its output as the response body. Every
//! outcome — success, gating rejection, upstream failure, client cancel —
//! lands in the usage log exactly once.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    attachments::resolve_attachments,
    auth::AuthContext,
    store::ConversationStore as _,
    chat::{
        stream::{StreamParams, StreamTransformer},
        validate::{validate, ValidatedRequest},
        Annotation, ChatRequest, ChatResponse, ContentBlock, MessageContent, Role, Usage,
    },
    error::ApiError,
    state::AppState,
    store::{NewMessage, StoreError},
    upstream::{build_router_body, last_user_message_mut},
    usage::{cost_milli_cents, UsageEvent, UsageOutcome},
};

/// `POST /chat` — buffered chat completion.
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let validated = prepare(&state, &context, request, started).await?;
    let request_id = triggering_message_id(&validated);

    let body = build_router_body(&validated, false);
    let upstream = match state.router.complete(&body).await {
        Ok(value) => value,
        Err(err) => {
            record_usage(
                &state, &context, &validated.model, &request_id,
                Usage::default(), UsageOutcome::UpstreamError, started,
            )
            .await;
            return Err(err);
        }
    };

    let response = shape_response(&validated, &request_id, &upstream, started);
    record_usage(
        &state, &context, &validated.model, &request_id,
        response.usage, UsageOutcome::Ok, started,
    )
    .await;

    let mut http = Json(&response).into_response();
    set_model_header(&mut http, &validated.model);
    Ok(http)
}

/// `POST /chat/stream` — streaming chat relay.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let validated = prepare(&state, &context, request, started).await?;
    let request_id = triggering_message_id(&validated);

    let body = build_router_body(&validated, true);
    let upstream = match state.router.stream(&body).await {
        Ok(stream) => stream,
        Err(err) => {
            record_usage(
                &state, &context, &validated.model, &request_id,
                Usage::default(), UsageOutcome::UpstreamError, started,
            )
            .await;
            return Err(err);
        }
    };

    let config = state.config();
    let markers_enabled = config.gateway.stream_markers_enabled;
    let params = StreamParams {
        model: validated.model.clone(),
        request_id: request_id.clone(),
        markers_enabled,
        forward_reasoning: markers_enabled
            && config.gateway.stream_reasoning_enabled
            && context.features.can_use_reasoning
            && validated.request.reasoning.is_some(),
        debug_enabled: config.gateway.stream_debug,
        deadline: std::time::Duration::from_secs(config.gateway.request_timeout_secs),
        warnings: validated.warnings.clone(),
    };

    let (summary_tx, summary_rx) = oneshot::channel();
    let transformer = StreamTransformer::new(upstream, params, summary_tx);

    // The transformer reports its outcome exactly once, including client
    // cancellation; this task turns it into the usage event.
    {
        let usage_log = Arc::clone(&state.usage);
        let prices = model_prices(&state, &validated.model).await;
        let subject = context.subject();
        let tier = context.tier();
        let model = validated.model.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move {
            if let Ok(summary) = summary_rx.await {
                usage_log.record(UsageEvent {
                    subject,
                    tier,
                    model_id: model,
                    input_tokens: summary.usage.prompt_tokens,
                    output_tokens: summary.usage.completion_tokens,
                    cost_milli_cents: cost_milli_cents(&summary.usage, prices.0, prices.1),
                    elapsed_ms: summary.elapsed_ms,
                    outcome: summary.outcome,
                    request_id,
                    timestamp: chrono::Utc::now(),
                });
            }
        });
    }

    let mut response = Response::new(Body::from_stream(transformer));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert("x-streaming", HeaderValue::from_static("true"));
    set_model_header(&mut response, &validated.model);
    Ok(response)
}

/// Validate and resolve attachments; gating rejections are recorded with
/// `outcome = rejected` before they surface.
async fn prepare(
    state: &Arc<AppState>,
    context: &AuthContext,
    request: ChatRequest,
    started: Instant,
) -> Result<ValidatedRequest, ApiError> {
    let requested_model = request.model.clone().unwrap_or_default();
    let catalog = state.catalog.snapshot().await;

    let mut validated = match validate(request, context, &catalog) {
        Ok(validated) => validated,
        Err(err) => {
            record_usage(
                state, context, &requested_model, "-",
                Usage::default(), UsageOutcome::Rejected, started,
            )
            .await;
            return Err(err);
        }
    };

    let attachment_ids = validated.request.attachment_ids.clone().unwrap_or_default();
    if !attachment_ids.is_empty() {
        let accepts_images = catalog
            .classify(&validated.model)
            .is_some_and(|c| c.multimodal_input);
        let blocks = match resolve_attachments(
            &attachment_ids,
            context,
            accepts_images,
            state.attachments.as_ref(),
            state.blobs.as_ref(),
            state.config().stores.signed_url_ttl_secs,
        )
        .await
        {
            Ok(blocks) => blocks,
            Err(err) => {
                record_usage(
                    state, context, &validated.model, "-",
                    Usage::default(), UsageOutcome::Rejected, started,
                )
                .await;
                return Err(err);
            }
        };
        insert_image_blocks(&mut validated.request, blocks);
    }

    Ok(validated)
}

/// Append resolved image blocks to the last user message.
fn insert_image_blocks(request: &mut ChatRequest, blocks: Vec<ContentBlock>) {
    let Some(message) = last_user_message_mut(&mut request.messages) else {
        return;
    };
    let mut combined = match &message.content {
        MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
        MessageContent::Blocks(existing) => existing.clone(),
    };
    combined.extend(blocks);
    message.content = MessageContent::Blocks(combined);
}

fn triggering_message_id(validated: &ValidatedRequest) -> String {
    validated
        .request
        .current_message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Build the contract response body from Router's buffered completion.
fn shape_response(
    validated: &ValidatedRequest,
    request_id: &str,
    upstream: &Value,
    started: Instant,
) -> ChatResponse {
    let message = upstream.pointer("/choices/0/message");
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let reasoning = message
        .and_then(|m| m.get("reasoning"))
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(String::from);

    let mut annotations: Vec<Annotation> = Vec::new();
    if let Some(raw) = message
        .and_then(|m| m.get("annotations"))
        .and_then(Value::as_array)
    {
        for value in raw {
            if let Some(annotation) = Annotation::from_upstream(value) {
                if !annotations.iter().any(|a| a.url == annotation.url) {
                    annotations.push(annotation);
                }
            }
        }
    }

    let usage: Usage = upstream
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    ChatResponse {
        response: content,
        usage,
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        content_type: ChatResponse::CONTENT_TYPE_MARKDOWN,
        id: upstream.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        model: Some(validated.model.clone()),
        reasoning,
        has_websearch: !annotations.is_empty(),
        websearch_result_count: annotations.len(),
        annotations,
        warnings: validated.warnings.clone(),
    }
}

async fn model_prices(state: &Arc<AppState>, model_id: &str) -> (f64, f64) {
    state
        .catalog
        .snapshot()
        .await
        .get(model_id)
        .map(|m| (m.price_per_k_input, m.price_per_k_output))
        .unwrap_or((0.0, 0.0))
}

async fn record_usage(
    state: &Arc<AppState>,
    context: &AuthContext,
    model: &str,
    request_id: &str,
    usage: Usage,
    outcome: UsageOutcome,
    started: Instant,
) {
    let prices = model_prices(state, model).await;
    state.usage.record(UsageEvent {
        subject: context.subject(),
        tier: context.tier(),
        model_id: model.to_string(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cost_milli_cents: cost_milli_cents(&usage, prices.0, prices.1),
        elapsed_ms: started.elapsed().as_millis() as u64,
        outcome,
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now(),
    });
}

fn set_model_header(response: &mut Response, model: &str) {
    if let Ok(value) = HeaderValue::from_str(model) {
        response.headers_mut().insert("x-model", value);
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Persistence callback surface
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<NewMessage>,
    #[serde(default)]
    pub attachment_ids: Option<Vec<String>>,
    /// Citations for the batch's last assistant message.
    #[serde(default)]
    pub annotations: Option<Vec<Annotation>>,
}

/// `POST /chat/messages` — persist a completed exchange.
pub async fn append_messages(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Json(body): Json<AppendRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = context.user.as_ref().ok_or_else(ApiError::auth_required)?;
    if body.messages.is_empty() {
        return Err(ApiError::bad_request("`messages` must not be empty."));
    }

    let title = body.title.clone().unwrap_or_else(|| {
        body.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.chars().take(60).collect())
            .unwrap_or_else(|| "New conversation".to_string())
    });

    state
        .conversations
        .create_session_if_missing(&body.session_id, &user.id, &title)
        .await
        .map_err(store_err)?;

    state
        .conversations
        .append_messages(
            &body.session_id,
            &user.id,
            body.messages.clone(),
            body.attachment_ids.as_deref(),
        )
        .await
        .map_err(store_err)?;

    if let Some(annotations) = &body.annotations {
        if let Some(assistant) = body.messages.iter().rev().find(|m| m.role == Role::Assistant) {
            state
                .conversations
                .persist_annotations(&user.id, &body.session_id, &assistant.id, annotations)
                .await
                .map_err(store_err)?;
        }
    }

    Ok(Json(json!({
        "status": "ok",
        "session_id": body.session_id,
        "appended": body.messages.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub session_id: String,
}

/// `GET /chat/messages?session_id=…`.
pub async fn read_messages(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = context.user.as_ref().ok_or_else(ApiError::auth_required)?;
    let messages = state
        .conversations
        .read_messages(&query.session_id, &user.id)
        .await
        .map_err(store_err)?;
    Ok(Json(json!({ "session_id": query.session_id, "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    20
}

/// `GET /chat/search?q=…&limit=…`.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = context.user.as_ref().ok_or_else(ApiError::auth_required)?;
    let results = state
        .conversations
        .search_conversations(&user.id, &query.q, query.limit.min(100))
        .await
        .map_err(store_err)?;
    Ok(Json(json!({ "query": query.q, "results": results })))
}

fn store_err(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound => ApiError::not_found("Session"),
        StoreError::Internal(e) => ApiError::internal(e),
    }
}
