//! Router client — buffered and streaming chat calls upstream.
//!
//! Two reqwest clients, one per mode: buffered calls carry the configured
//! request timeout; streaming calls have no request-level timeout because
//! the body arrives incrementally (the per-request deadline is enforced by
//! the caller). TCP connect timeouts apply to both.
//!
//! Retry policy: at most one retry, only for failures where no response
//! byte has been seen — connect errors and 502/503/504 — with a short
//! random jitter. 4xx responses and opened streams are never retried.

use std::{pin::Pin, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use rand::Rng;
use reqwest::{header, Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    chat::{validate::ValidatedRequest, ChatMessage, Role},
    error::{ApiError, ErrorCode},
};

/// A `Send`-able, heap-allocated upstream byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Maximum upstream error body captured into logs and error context.
const BODY_PREVIEW_BYTES: usize = 2 * 1024;

/// Upper bound on the retry jitter.
const RETRY_JITTER_MS: u64 = 250;

pub struct RouterClient {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
}

impl RouterClient {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout_ms: u64) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at
            // startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("Router API key contains invalid Authorization header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Buffered chat completion. Returns Router's parsed JSON response.
    pub async fn complete(&self, body: &Value) -> Result<Value, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self.send_with_retry(&self.client, &url, body).await?;

        let text = response
            .text()
            .await
            .context("reading Router response body")?;
        serde_json::from_str(&text)
            .with_context(|| "parsing Router response as JSON".to_string())
            .map_err(ApiError::from)
    }

    /// Open a streaming chat completion and return the raw SSE byte stream.
    pub async fn stream(&self, body: &Value) -> Result<ByteStream, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self.send_with_retry(&self.stream_client, &url, body).await?;
        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }

    /// POST the body, retrying once for pre-first-byte transient failures.
    async fn send_with_retry(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> Result<Response, ApiError> {
        let mut attempted_retry = false;
        loop {
            let result = client.post(url).json(body).send().await;
            let retryable = match &result {
                Err(e) => e.is_connect() || e.is_timeout(),
                Ok(response) => matches!(
                    response.status(),
                    StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                ),
            };

            if retryable && !attempted_retry {
                attempted_retry = true;
                let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
                warn!(url, jitter_ms = jitter, "transient Router failure — retrying once");
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                continue;
            }

            return match result {
                Err(e) => Err(ApiError::new(
                    ErrorCode::UpstreamError,
                    "The upstream provider could not be reached.",
                )
                .with_source(e.into())),
                Ok(response) if response.status().is_success() => Ok(response),
                Ok(response) => Err(enrich_error(response).await),
            };
        }
    }
}

/// Build a non-2xx Router response into a structured [`ApiError`], emitting
/// the single diagnostic log line with the upstream request id, status, and
/// a bounded body preview.
async fn enrich_error(response: Response) -> ApiError {
    let status = response.status();
    let upstream_request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let rate_headers: Vec<String> = response
        .headers()
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ratelimit"))
        .map(|(name, value)| format!("{name}={}", value.to_str().unwrap_or("?")))
        .collect();

    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(BODY_PREVIEW_BYTES).collect();

    warn!(
        upstream_request_id = upstream_request_id.as_deref().unwrap_or("-"),
        status = status.as_u16(),
        rate_limit = rate_headers.join(","),
        body_preview = %preview,
        "Router returned an error response"
    );

    // Router reports unknown models with a dedicated error code in the body.
    let model_not_found = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/code")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .is_some_and(|code| code == "model_not_found");

    let (code, message) = if model_not_found {
        (
            ErrorCode::ModelUnavailable,
            "The requested model is not available upstream.",
        )
    } else if status.is_client_error() {
        (
            ErrorCode::UpstreamRejected,
            "The upstream provider rejected the request.",
        )
    } else {
        (
            ErrorCode::UpstreamError,
            "The upstream provider failed to serve the request.",
        )
    };

    ApiError::new(code, message).with_source(anyhow::anyhow!(
        "router status {status}, upstream request id {:?}, body: {preview}",
        upstream_request_id
    ))
}

/// Assemble the Router request body from a validated request.
///
/// The system prompt travels as a leading `system` message; web search is
/// requested through Router's plugin mechanism; the output cap computed by
/// the validator becomes `max_tokens`.
pub fn build_router_body(validated: &ValidatedRequest, stream: bool) -> Value {
    let request = &validated.request;

    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(prompt) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for message in &request.messages {
        messages.push(serde_json::to_value(message).expect("chat message serializes"));
    }

    let mut body = json!({
        "model": validated.model,
        "messages": messages,
        "max_tokens": validated.max_output_tokens,
        "stream": stream,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(reasoning) = &request.reasoning {
        body["reasoning"] = json!({ "effort": reasoning.effort });
    }
    if request.web_search {
        body["plugins"] = json!([{ "id": "web" }]);
    }
    if stream {
        // Ask Router to append a usage record to the stream tail.
        body["usage"] = json!({ "include": true });
    }
    body
}

/// Whether a message list's last user entry exists — the insertion point for
/// resolved attachment blocks.
pub fn last_user_message_mut(messages: &mut [ChatMessage]) -> Option<&mut ChatMessage> {
    messages.iter_mut().rev().find(|m| m.role == Role::User)
}
