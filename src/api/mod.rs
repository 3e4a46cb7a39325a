//! HTTP surface — route table and per-group middleware policies.
//!
//! Handlers are a thin layer: they translate HTTP concerns into calls to the
//! validator, the Router client, the stream transformer, and the stores.
//! Access control is entirely declarative here — each route group gets a
//! [`RoutePolicy`] and the composed middleware does the rest.

pub mod admin;
pub mod attachments;
pub mod chat;
pub mod health;
pub mod internal;
pub mod models;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::{
    config::RateClass,
    middleware::{enforce, internal_auth, RoutePolicy},
    state::AppState,
};

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let policy = |p: RoutePolicy| from_fn_with_state((Arc::clone(&state), p), enforce);

    // Chat execution: optional auth, class A, and the only place where a
    // ban bites.
    let chat_exec = Router::new()
        .route("/chat", post(chat::complete))
        .route("/chat/stream", post(chat::stream))
        .route_layer(policy(
            RoutePolicy::enhanced(RateClass::A)
                .with_ban_enforcement(true)
                .with_bypass_allowed(),
        ));

    // Conversation management: authenticated, class B, usable while banned.
    let chat_mgmt = Router::new()
        .route("/chat/messages", post(chat::append_messages).get(chat::read_messages))
        .route("/chat/search", get(chat::search))
        .route_layer(policy(
            RoutePolicy::protected(RateClass::B).with_ban_enforcement(false),
        ));

    let uploads = Router::new()
        .route("/attachments/upload", post(attachments::upload))
        .route_layer(policy(
            RoutePolicy::protected(RateClass::B).with_ban_enforcement(false),
        ))
        .layer(axum::extract::DefaultBodyLimit::max(attachments::MAX_UPLOAD_BYTES));

    let public = Router::new()
        .route("/models", get(models::list))
        .route_layer(policy(RoutePolicy::public(RateClass::C)));

    let admin = Router::new()
        .route("/admin/users/{id}/ban", post(admin::ban))
        .route("/admin/users/{id}/unban", post(admin::unban))
        .route_layer(policy(RoutePolicy::admin()));

    // Operator surface: shared secret, no rate class.
    let internal = Router::new()
        .route("/internal/attachments/retention", post(attachments::retention))
        .route("/internal/attachments/cleanup", post(attachments::cleanup))
        .route("/internal/usage", get(internal::usage))
        .route_layer(from_fn_with_state(Arc::clone(&state), internal_auth));

    Router::new()
        .route("/healthz", get(health::healthz))
        .merge(chat_exec)
        .merge(chat_mgmt)
        .merge(uploads)
        .merge(public)
        .merge(admin)
        .merge(internal)
        .with_state(state)
}
