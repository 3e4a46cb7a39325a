//! Attachment resolution — ownership checks and signed URL minting.
//!
//! A chat request may reference previously uploaded images by id. Before the
//! request reaches Router, every id must pass the ownership gate (owned by
//! the caller, upload finished, not yet bound to another message) and the
//! target model must accept image input. The resolver mints short-lived
//! signed URLs and returns ordered `image_url` content blocks; binding ids
//! to the stored user message happens on the persistence path after the
//! chat completes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthContext,
    chat::{ContentBlock, ImageUrl},
    error::{ApiError, ErrorCode},
};

/// Accepted upload MIME types. Everything else is rejected at upload and at
/// resolution time.
pub const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/webp"];

/// Hard per-message cap, independent of tier configuration.
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Ready,
    Failed,
}

/// One stored attachment row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub user_id: String,
    pub mime: String,
    pub storage_bucket: String,
    pub storage_path: String,
    pub status: AttachmentStatus,
    pub session_id: Option<String>,
    /// Set once the attachment is bound to a stored message; bound rows can
    /// never be sent again.
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Store surface for attachment rows. Implementations enforce `user_id`
/// filtering themselves — the resolver's checks are not the last line.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn insert(&self, record: AttachmentRecord) -> anyhow::Result<()>;

    /// Fetch rows by id, in the order given. Missing ids are simply absent.
    async fn get_many(&self, ids: &[String]) -> anyhow::Result<Vec<AttachmentRecord>>;

    /// Bind up to [`MAX_ATTACHMENTS_PER_MESSAGE`] still-unlinked rows owned
    /// by `user_id` to the given message, atomically per row. Returns the
    /// number of rows actually linked.
    async fn link_to_message(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: &str,
        ids: &[String],
    ) -> anyhow::Result<u32>;

    /// Remove unlinked rows created before `cutoff`; returns the removed
    /// rows so the caller can delete the blobs.
    async fn purge_unlinked_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttachmentRecord>>;

    /// Remove rows whose upload failed; returns the removed rows.
    async fn purge_failed(&self) -> anyhow::Result<Vec<AttachmentRecord>>;
}

/// Blob storage surface: raw bytes in, signed GET URLs out.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: bytes::Bytes,
        mime: &str,
    ) -> anyhow::Result<()>;

    /// Mint a signed GET URL valid for `ttl_secs`.
    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> anyhow::Result<String>;

    async fn delete(&self, bucket: &str, path: &str) -> anyhow::Result<()>;
}

/// Resolve attachment ids into ordered `image_url` content blocks.
///
/// Failure modes (checked in this order):
/// - more ids than the per-message cap → `ATTACHMENT_LIMIT`
/// - caller not authenticated, model without image input, or any row
///   missing/foreign/unready/already-linked/wrong-mime → `ATTACHMENT_INVALID`
pub async fn resolve_attachments(
    ids: &[String],
    context: &AuthContext,
    model_accepts_images: bool,
    store: &dyn AttachmentStore,
    blobs: &dyn BlobStore,
    signed_url_ttl_secs: u64,
) -> Result<Vec<ContentBlock>, ApiError> {
    if ids.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(ApiError::new(
            ErrorCode::AttachmentLimit,
            format!("At most {MAX_ATTACHMENTS_PER_MESSAGE} attachments per message."),
        ));
    }

    let Some(user) = &context.user else {
        return Err(invalid("attachments require an authenticated caller"));
    };

    if !model_accepts_images {
        return Err(invalid("the selected model does not accept image input"));
    }

    let records = store.get_many(ids).await?;
    if records.len() != ids.len() {
        return Err(invalid("one or more attachments do not exist"));
    }

    let mut blocks = Vec::with_capacity(records.len());
    for record in &records {
        if record.user_id != user.id {
            return Err(invalid("attachment is not owned by the caller"));
        }
        if record.status != AttachmentStatus::Ready {
            return Err(invalid("attachment upload has not completed"));
        }
        if record.message_id.is_some() {
            return Err(invalid("attachment is already bound to a message"));
        }
        if !ALLOWED_MIME.contains(&record.mime.as_str()) {
            return Err(invalid("attachment has an unsupported media type"));
        }

        let url = blobs
            .signed_url(&record.storage_bucket, &record.storage_path, signed_url_ttl_secs)
            .await
            .map_err(|e| {
                ApiError::new(ErrorCode::AttachmentInvalid, "Attachment could not be prepared.")
                    .with_source(e)
            })?;
        blocks.push(ContentBlock::ImageUrl { image_url: ImageUrl { url } });
    }

    Ok(blocks)
}

fn invalid(detail: &str) -> ApiError {
    ApiError::new(
        ErrorCode::AttachmentInvalid,
        format!("Attachment rejected: {detail}."),
    )
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory implementations — development mode and tests
// ──────────────────────────────────────────────────────────────────────────────

/// DashMap-backed [`AttachmentStore`]. Single-process only.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    rows: DashMap<String, AttachmentRecord>,
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn insert(&self, record: AttachmentRecord) -> anyhow::Result<()> {
        self.rows.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_many(&self, ids: &[String]) -> anyhow::Result<Vec<AttachmentRecord>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.rows.get(id).map(|r| r.clone()))
            .collect())
    }

    async fn link_to_message(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: &str,
        ids: &[String],
    ) -> anyhow::Result<u32> {
        let mut linked = 0u32;
        for id in ids {
            if linked as usize >= MAX_ATTACHMENTS_PER_MESSAGE {
                break;
            }
            if let Some(mut row) = self.rows.get_mut(id) {
                // Compare-and-set per row: only unlinked rows owned by the
                // caller are bound.
                if row.user_id == user_id && row.message_id.is_none() {
                    row.message_id = Some(message_id.to_string());
                    row.session_id = Some(session_id.to_string());
                    linked += 1;
                }
            }
        }
        Ok(linked)
    }

    async fn purge_unlinked_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttachmentRecord>> {
        let doomed: Vec<String> = self
            .rows
            .iter()
            .filter(|r| r.message_id.is_none() && r.created_at < cutoff)
            .map(|r| r.id.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|id| self.rows.remove(id).map(|(_, r)| r))
            .collect())
    }

    async fn purge_failed(&self) -> anyhow::Result<Vec<AttachmentRecord>> {
        let doomed: Vec<String> = self
            .rows
            .iter()
            .filter(|r| r.status == AttachmentStatus::Failed)
            .map(|r| r.id.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|id| self.rows.remove(id).map(|(_, r)| r))
            .collect())
    }
}

/// DashMap-backed [`BlobStore`]. Signed URLs are synthetic but carry the
/// expiry so tests can assert the TTL contract.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, bytes::Bytes>,
}

impl MemoryBlobStore {
    fn key(bucket: &str, path: &str) -> String {
        format!("{bucket}/{path}")
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: bytes::Bytes,
        _mime: &str,
    ) -> anyhow::Result<()> {
        self.blobs.insert(Self::key(bucket, path), bytes);
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> anyhow::Result<String> {
        let key = Self::key(bucket, path);
        anyhow::ensure!(self.blobs.contains_key(&key), "blob {key} does not exist");
        let expires = Utc::now().timestamp() as u64 + ttl_secs;
        Ok(format!("memory://{key}?expires={expires}"))
    }

    async fn delete(&self, bucket: &str, path: &str) -> anyhow::Result<()> {
        self.blobs.remove(&Self::key(bucket, path));
        Ok(())
    }
}
