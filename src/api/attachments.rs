//! Attachment upload and the internal retention hooks.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    attachments::{AttachmentRecord, AttachmentStatus, AttachmentStore as _, BlobStore as _, ALLOWED_MIME},
    auth::AuthContext,
    error::{ApiError, ErrorCode},
    state::AppState,
};

/// Upload body cap; images beyond this are rejected by the body limit layer.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const BUCKET: &str = "attachments";

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// `POST /attachments/upload` — multipart image upload.
///
/// The row is inserted `ready` once the blob write completes; a blob-store
/// failure leaves no row behind.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let user = context.user.as_ref().ok_or_else(ApiError::auth_required)?;
    if !context.features.can_use_attachments {
        return Err(ApiError::feature_not_available("attachments"));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let mime = field.content_type().unwrap_or_default().to_string();
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Err(ApiError::new(
                ErrorCode::AttachmentInvalid,
                "Attachment rejected: only PNG, JPEG, and WebP images are accepted.",
            ));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("uploaded file is empty"));
        }

        let id = Uuid::new_v4().to_string();
        let path = format!("{}/{id}.{}", user.id, extension_for(&mime));
        state.blobs.put(BUCKET, &path, bytes, &mime).await?;

        let record = AttachmentRecord {
            id: id.clone(),
            user_id: user.id.clone(),
            mime: mime.clone(),
            storage_bucket: BUCKET.to_string(),
            storage_path: path,
            status: AttachmentStatus::Ready,
            session_id: None,
            message_id: None,
            created_at: Utc::now(),
        };
        state.attachments.insert(record).await?;

        return Ok(Json(json!({ "id": id, "mime": mime, "status": "ready" })));
    }

    Err(ApiError::bad_request("multipart field `file` is required"))
}

#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    #[serde(default = "default_retention_hours")]
    pub older_than_hours: u64,
}

fn default_retention_hours() -> u64 {
    24
}

/// `POST /internal/attachments/retention` — purge unlinked uploads older
/// than the cutoff, blobs included. Invoked by the retention cron.
pub async fn retention(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RetentionRequest>>,
) -> Result<Json<Value>, ApiError> {
    let hours = body.map(|Json(b)| b.older_than_hours).unwrap_or_else(default_retention_hours);
    let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);

    let purged = state.attachments.purge_unlinked_before(cutoff).await?;
    for record in &purged {
        // Blob deletion is best-effort; a leaked blob is found by the next run.
        if let Err(e) = state.blobs.delete(&record.storage_bucket, &record.storage_path).await {
            tracing::warn!(attachment = %record.id, error = %e, "blob deletion failed during retention");
        }
    }

    info!(purged = purged.len(), older_than_hours = hours, "attachment retention pass");
    Ok(Json(json!({ "purged": purged.len() })))
}

/// `POST /internal/attachments/cleanup` — drop rows whose upload failed.
pub async fn cleanup(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let purged = state.attachments.purge_failed().await?;
    for record in &purged {
        if let Err(e) = state.blobs.delete(&record.storage_bucket, &record.storage_path).await {
            tracing::warn!(attachment = %record.id, error = %e, "blob deletion failed during cleanup");
        }
    }

    info!(purged = purged.len(), "attachment cleanup pass");
    Ok(Json(json!({ "purged": purged.len() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::attachments::AttachmentStore as _;
    use crate::auth::resolver::sign_test_token;
    use crate::auth::Tier;
    use crate::state::test_support::{seed_user, state_for_tests};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "test-boundary-7MA4YWxk";

    fn multipart_body(mime: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"upload\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn upload_as(
        app: &axum::Router,
        sub: &str,
        mime: &str,
        payload: &[u8],
    ) -> axum::response::Response {
        let token = sign_test_token(sub, &format!("{sub}@example.com"), 3600);
        app.clone()
            .oneshot(
                Request::post("/attachments/upload")
                    .header("authorization", format!("Bearer {token}"))
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(multipart_body(mime, payload)))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pro_user_can_upload_a_png() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_user(&auth, "alice", Tier::Pro, false);

        let resp = upload_as(&app, "alice", "image/png", b"fake-png-bytes").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ready");

        let id = value["id"].as_str().unwrap().to_string();
        let rows = state.attachments.get_many(&[id]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "alice");
        assert_eq!(rows[0].status, AttachmentStatus::Ready);
    }

    #[tokio::test]
    async fn gif_uploads_are_rejected() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_user(&auth, "alice", Tier::Pro, false);

        let resp = upload_as(&app, "alice", "image/gif", b"GIF89a").await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("ATTACHMENT_INVALID"));
    }

    #[tokio::test]
    async fn free_tier_cannot_upload() {
        let (state, auth) = state_for_tests("http://127.0.0.1:9");
        let app = api::router(Arc::clone(&state));
        seed_user(&auth, "cheapskate", Tier::Free, false);

        let resp = upload_as(&app, "cheapskate", "image/png", b"x").await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn retention_endpoint_purges_old_unlinked_rows() {
        let (state, _) = state_for_tests("http://127.0.0.1:9");
        let mut config = (*state.config()).clone();
        config.gateway.internal_shared_secret = Some("ops".into());
        state.replace_config(Arc::new(config));
        let app = api::router(Arc::clone(&state));

        let mut stale = AttachmentRecord {
            id: "old".into(),
            user_id: "alice".into(),
            mime: "image/png".into(),
            storage_bucket: BUCKET.into(),
            storage_path: "alice/old.png".into(),
            status: AttachmentStatus::Ready,
            session_id: None,
            message_id: None,
            created_at: Utc::now(),
        };
        stale.created_at = Utc::now() - chrono::Duration::hours(48);
        state.attachments.insert(stale).await.unwrap();

        let resp = app
            .oneshot(
                Request::post("/internal/attachments/retention")
                    .header("authorization", "Bearer ops")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"older_than_hours": 24}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["purged"], 1);
        assert!(state.attachments.get_many(&["old".into()]).await.unwrap().is_empty());
    }
}
