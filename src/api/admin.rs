//! Admin surface — ban and unban.
//!
//! Both operations write through the auth store and then drop the user's
//! cached snapshot so the change takes effect on their next request rather
//! than after the snapshot TTL.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    auth::AuthContext,
    error::ApiError,
    state::AppState,
    store::{AuthSnapshotStore as _, StoreError},
};

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub reason: String,
    /// Absent means the ban is indefinite.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UnbanRequest {
    pub reason: String,
}

/// `POST /admin/users/{id}/ban`.
pub async fn ban(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(body): Json<BanRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .auth_store
        .set_ban(&user_id, true, body.until)
        .await
        .map_err(store_err)?;
    state.snapshots.invalidate(&user_id).await;

    info!(
        admin = context.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
        target = %user_id,
        reason = %body.reason,
        until = ?body.until,
        "user banned"
    );
    Ok(Json(json!({ "status": "ok", "user_id": user_id, "banned": true })))
}

/// `POST /admin/users/{id}/unban`.
pub async fn unban(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(body): Json<UnbanRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .auth_store
        .set_ban(&user_id, false, None)
        .await
        .map_err(store_err)?;
    state.snapshots.invalidate(&user_id).await;

    info!(
        admin = context.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
        target = %user_id,
        reason = %body.reason,
        "user unbanned"
    );
    Ok(Json(json!({ "status": "ok", "user_id": user_id, "banned": false })))
}

fn store_err(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound => ApiError::not_found("User"),
        StoreError::Internal(e) => ApiError::internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::auth::resolver::sign_test_token;
    use crate::auth::Tier;
    use crate::state::test_support::{seed_admin, seed_user, state_for_tests};
    use crate::store::AuthSnapshotStore as _;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn post(
        app: &axum::Router,
        uri: &str,
        sub: &str,
        body: Value,
    ) -> axum::response::Response {
        let token = sign_test_token(sub, &format!("{sub}@example.com"), 3600);
        app.clone()
            .oneshot(
                Request::post(uri)
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn admin_can_ban_and_unban_a_user() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_admin(&auth, "root", Tier::Enterprise);
        seed_user(&auth, "target", Tier::Free, false);

        let resp = post(
            &app,
            "/admin/users/target/ban",
            "root",
            json!({ "reason": "abuse" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(auth.load_profile("target").await.unwrap().unwrap().banned);

        let resp = post(
            &app,
            "/admin/users/target/unban",
            "root",
            json!({ "reason": "appeal accepted" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!auth.load_profile("target").await.unwrap().unwrap().banned);
    }

    #[tokio::test]
    async fn non_admin_cannot_reach_the_admin_surface() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_user(&auth, "mortal", Tier::Enterprise, false);
        seed_user(&auth, "target", Tier::Free, false);

        let resp = post(
            &app,
            "/admin/users/target/ban",
            "mortal",
            json!({ "reason": "grudge" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(!auth.load_profile("target").await.unwrap().unwrap().banned);
    }

    #[tokio::test]
    async fn banning_an_unknown_user_is_not_found() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_admin(&auth, "root", Tier::Enterprise);

        let resp = post(
            &app,
            "/admin/users/ghost/ban",
            "root",
            json!({ "reason": "abuse" }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
