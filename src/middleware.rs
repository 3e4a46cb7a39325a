//! Request middleware — auth resolution, ban enforcement, rate limiting.
//!
//! Every route group is wrapped by [`enforce`] with a [`RoutePolicy`]
//! describing its access level, rate class, and ban behavior. The checks
//! run in a fixed order — resolve auth, check ban, check rate limit — and a
//! failure short-circuits the rest: a rate-limited request never reaches a
//! handler, and a ban rejection is a policy event, not an error.
//!
//! Ban policy is chat-only by product decision: only chat-execute endpoints
//! opt into enforcement; read and management endpoints keep working for
//! banned users.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    auth::AccessLevel,
    config::RateClass,
    error::ApiError,
    ratelimit::RateDecision,
    state::AppState,
};

/// Per-route-group middleware policy.
#[derive(Debug, Clone, Copy)]
pub struct RoutePolicy {
    pub access: AccessLevel,
    /// `None` skips rate limiting entirely (internal endpoints).
    pub rate_class: Option<RateClass>,
    /// Reject banned callers before the handler runs.
    pub enforce_ban: bool,
    /// Honor `features.can_bypass_rate_limit` on this route.
    pub allow_bypass: bool,
    /// Additionally require an admin account.
    pub require_admin: bool,
}

impl RoutePolicy {
    /// Anonymous callers welcome; no ban enforcement.
    pub fn public(rate_class: RateClass) -> Self {
        Self {
            access: AccessLevel::Public,
            rate_class: Some(rate_class),
            enforce_ban: false,
            allow_bypass: false,
            require_admin: false,
        }
    }

    /// Optional authentication; invalid credentials degrade to anonymous.
    /// Ban enforcement is off unless the endpoint opts in.
    pub fn enhanced(rate_class: RateClass) -> Self {
        Self {
            access: AccessLevel::Enhanced,
            ..Self::public(rate_class)
        }
    }

    /// Authentication required; ban enforcement on by default.
    pub fn protected(rate_class: RateClass) -> Self {
        Self {
            access: AccessLevel::Protected,
            rate_class: Some(rate_class),
            enforce_ban: true,
            allow_bypass: false,
            require_admin: false,
        }
    }

    /// Admin surface: protected, admin account, class D budget.
    pub fn admin() -> Self {
        Self {
            require_admin: true,
            ..Self::protected(RateClass::D)
        }
    }

    /// Per-endpoint ban override (the chat-only ban switch).
    pub fn with_ban_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_ban = enforce;
        self
    }

    pub fn with_bypass_allowed(mut self) -> Self {
        self.allow_bypass = true;
        self
    }
}

/// The composed middleware: auth-resolve, ban-check, rate-limit, in that
/// order. Installed via `axum::middleware::from_fn_with_state` with an
/// `(state, policy)` tuple.
pub async fn enforce(
    State((state, policy)): State<(Arc<AppState>, RoutePolicy)>,
    mut req: Request,
    next: Next,
) -> Response {
    // Peer address from extensions — set by into_make_service_with_connect_info.
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

    let context = match state.resolve_auth(req.headers(), peer_ip, policy.access).await {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };

    if policy.enforce_ban {
        if let Some(profile) = &context.profile {
            if profile.is_banned_at(chrono::Utc::now()) {
                return with_request_id(ApiError::account_banned().into_response(), &context.request_id);
            }
        }
    }

    if policy.require_admin && !context.is_admin() {
        return with_request_id(
            ApiError::forbidden("This endpoint requires an admin account.").into_response(),
            &context.request_id,
        );
    }

    let mut rate_decision: Option<RateDecision> = None;
    if let Some(class) = policy.rate_class {
        let bypass = policy.allow_bypass && context.features.can_bypass_rate_limit;
        if !bypass {
            let decision = state
                .limiter
                .check(class, context.tier(), &context.subject())
                .await;
            if !decision.allowed {
                let mut response =
                    ApiError::rate_limited(decision.retry_after_secs).into_response();
                apply_rate_headers(&mut response, &decision);
                return with_request_id(response, &context.request_id);
            }
            rate_decision = Some(decision);
        }
    }

    let request_id = context.request_id.clone();
    req.extensions_mut().insert(context);
    let mut response = next.run(req).await;

    if let Some(decision) = rate_decision {
        apply_rate_headers(&mut response, &decision);
    }
    with_request_id(response, &request_id)
}

fn apply_rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set("x-ratelimit-limit", decision.limit.to_string());
    set("x-ratelimit-remaining", decision.remaining.to_string());
    set("x-ratelimit-reset", decision.reset_epoch_secs.to_string());
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Shared-secret guard for the `/internal` surface. With no secret
/// configured every request is rejected — fail closed, not open.
pub async fn internal_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config();
    let Some(expected) = &config.gateway.internal_shared_secret else {
        return ApiError::forbidden("Internal endpoints are not enabled.").into_response();
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(secret) if secret == expected.as_str() => next.run(req).await,
        _ => ApiError::forbidden("A valid internal secret is required.").into_response(),
    }
}
