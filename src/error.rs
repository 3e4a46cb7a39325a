//! Unified HTTP error type for axum request handlers.
//!
//! [`ApiError`] carries a stable wire code from the gateway's error taxonomy
//! and converts itself into the JSON error envelope via [`IntoResponse`].
//! Every handler that can fail returns `Result<T, ApiError>` and propagates
//! with `?` — no manual `map_err`, no boilerplate.
//!
//! The envelope is part of the client contract:
//!
//! ```json
//! { "error": "...", "code": "RATE_LIMIT_EXCEEDED", "retryable": true,
//!   "suggestions": ["..."], "timestamp": "2025-01-01T00:00:00Z" }
//! ```
//!
//! Suggestions are fixed strings chosen per code — never derived from
//! upstream messages, so internals cannot leak through them.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Stable machine-readable error codes surfaced to clients.
///
/// The HTTP status for each code is fixed — see [`ErrorCode::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    TokenInvalid,
    TokenExpired,
    AuthRequired,
    AccountBanned,
    Forbidden,
    FeatureNotAvailable,
    NotFound,
    TokenLimitExceeded,
    AttachmentInvalid,
    AttachmentLimit,
    RateLimitExceeded,
    ModelUnavailable,
    UpstreamRejected,
    UpstreamError,
    Internal,
}

impl ErrorCode {
    /// Wire representation, e.g. `"RATE_LIMIT_EXCEEDED"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AccountBanned => "ACCOUNT_BANNED",
            Self::Forbidden => "FORBIDDEN",
            Self::FeatureNotAvailable => "FEATURE_NOT_AVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            Self::AttachmentInvalid => "ATTACHMENT_INVALID",
            Self::AttachmentLimit => "ATTACHMENT_LIMIT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ModelUnavailable => "MODEL_UNAVAILABLE",
            Self::UpstreamRejected => "UPSTREAM_REJECTED",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status mapping. Part of the stable client contract.
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::AttachmentLimit => StatusCode::BAD_REQUEST,
            Self::TokenInvalid | Self::TokenExpired | Self::AuthRequired => {
                StatusCode::UNAUTHORIZED
            }
            Self::AccountBanned
            | Self::Forbidden
            | Self::FeatureNotAvailable
            | Self::AttachmentInvalid => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::TokenLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelUnavailable | Self::UpstreamRejected => StatusCode::BAD_GATEWAY,
            Self::UpstreamError | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client retry of the identical request can reasonably succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::UpstreamError | Self::Internal
        )
    }

    /// Fixed, user-safe remediation hints per code.
    fn suggestions(self) -> &'static [&'static str] {
        match self {
            Self::TokenInvalid | Self::TokenExpired | Self::AuthRequired => {
                &["Sign in again to refresh your session."]
            }
            Self::AccountBanned => &["Contact support if you believe this is a mistake."],
            Self::FeatureNotAvailable => &["Upgrade your plan to use this feature."],
            Self::TokenLimitExceeded => {
                &["Shorten the conversation or start a new session."]
            }
            Self::AttachmentInvalid => {
                &["Re-upload the image and retry; only your own ready attachments can be sent."]
            }
            Self::AttachmentLimit => &["Send at most 3 attachments per message."],
            Self::RateLimitExceeded => &["Wait for the indicated delay before retrying."],
            Self::ModelUnavailable => &["Pick a different model and retry."],
            Self::UpstreamRejected | Self::UpstreamError => {
                &["Retry shortly; the upstream provider rejected or failed the request."]
            }
            _ => &[],
        }
    }
}

/// A request-scoped failure with a stable wire code.
///
/// Construct through the per-code helpers (`ApiError::rate_limited`, …) or
/// the generic [`ApiError::new`]. Internal errors additionally capture the
/// source for the server log; only the fixed message reaches the client.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// `Retry-After` response header value, seconds. Rate-limit only.
    pub retry_after: Option<u64>,
    /// Server-side cause, logged but never serialized to the client.
    source: Option<anyhow::Error>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "Authentication required.")
    }

    pub fn token_invalid() -> Self {
        Self::new(ErrorCode::TokenInvalid, "The provided token is not valid.")
    }

    pub fn token_expired() -> Self {
        Self::new(ErrorCode::TokenExpired, "The provided token has expired.")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn account_banned() -> Self {
        Self::new(
            ErrorCode::AccountBanned,
            "This account is not permitted to send chat messages.",
        )
    }

    pub fn feature_not_available(feature: &str) -> Self {
        Self::new(
            ErrorCode::FeatureNotAvailable,
            format!("The `{feature}` feature is not available on your plan."),
        )
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} not found."))
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        let mut err = Self::new(
            ErrorCode::RateLimitExceeded,
            "Too many requests. Slow down and retry after the indicated delay.",
        );
        err.retry_after = Some(retry_after.max(1));
        err
    }

    pub fn internal(source: anyhow::Error) -> Self {
        let mut err = Self::new(ErrorCode::Internal, "Internal error.");
        err.source = Some(source);
        err
    }

    /// Attach a server-side cause without changing the client-visible message.
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Convert any `Into<anyhow::Error>` into an INTERNAL [`ApiError`].
///
/// This keeps `?` working in handlers for io/reqwest/serde errors without
/// leaking their messages to clients.
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self::internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match (&self.source, self.code) {
            (Some(src), _) => {
                tracing::error!(code = self.code.as_str(), error = %src, "handler error")
            }
            // Policy rejections are expected events, not errors.
            (None, ErrorCode::AccountBanned | ErrorCode::RateLimitExceeded) => {
                tracing::info!(code = self.code.as_str(), "request rejected")
            }
            (None, _) => {
                tracing::warn!(code = self.code.as_str(), error = %self.message, "request failed")
            }
        }

        let suggestions = self.code.suggestions();
        let mut body = json!({
            "error": self.message,
            "code": self.code.as_str(),
            "retryable": self.code.retryable(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if !suggestions.is_empty() {
            body["suggestions"] = json!(suggestions);
        }

        let mut response = (self.code.status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
