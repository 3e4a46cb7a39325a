//! Chat request/response wire types.
//!
//! These mirror the client contract byte-for-byte where the contract is
//! fixed (the non-streaming response body, annotation objects) and stay
//! permissive on input (message content may be a plain string or a block
//! list, matching what browsers actually send).

pub mod stream;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single typed content block inside a message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// All text carried by this content, blocks included.
    pub fn text_parts(&self) -> Vec<&str> {
        match self {
            Self::Text(text) => vec![text.as_str()],
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Self::Text(_) => 0,
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ImageUrl { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Requested reasoning depth, forwarded to Router when permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReasoningOptions {
    pub effort: ReasoningEffort,
}

/// Inbound chat request body for `/chat` and `/chat/stream`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,

    /// Requested model id. Missing or out-of-tier models downgrade to the
    /// caller's first allowed model — never a hard failure.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,

    #[serde(default)]
    pub web_search: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOptions>,

    #[serde(default)]
    pub stream: bool,

    /// Client-assigned id of the triggering user message; echoed back as
    /// `request_id` in the response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_message_id: Option<String>,

    /// Session to persist into on the completion callback path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Token accounting as reported by Router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A URL citation attached to the response, deduplicated by URL.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AnnotationKind {
    #[serde(rename = "url_citation")]
    UrlCitation,
}

impl Annotation {
    /// Parse an upstream annotation record. Router emits either the flat
    /// form (`{"type":"url_citation","url":…}`) or a nested form with the
    /// fields wrapped under a `url_citation` object; both flatten to the
    /// same wire shape.
    pub fn from_upstream(value: &Value) -> Option<Self> {
        if value.get("type")?.as_str()? != "url_citation" {
            return None;
        }
        let inner = value.get("url_citation").unwrap_or(value);
        let url = inner.get("url")?.as_str()?.to_string();
        Some(Self {
            kind: AnnotationKind::UrlCitation,
            url,
            title: inner
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
            content: inner
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            start_index: inner.get("start_index").and_then(Value::as_u64),
            end_index: inner.get("end_index").and_then(Value::as_u64),
        })
    }
}

/// The non-streaming chat response body — also the payload of the terminal
/// metadata envelope on streams. Field names are part of the contract.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub usage: Usage,
    /// The triggering user message id.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(rename = "contentType")]
    pub content_type: &'static str,
    /// Upstream completion id.
    pub id: String,
    /// Model that actually served the request (after any downgrade).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub annotations: Vec<Annotation>,
    pub has_websearch: bool,
    pub websearch_result_count: usize,
    /// Non-fatal rewrites applied by validation ("model downgraded", …).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ChatResponse {
    pub const CONTENT_TYPE_MARKDOWN: &'static str = "markdown";
}
