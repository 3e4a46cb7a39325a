//! Persistence facade — the store surface the gateway core depends on.
//!
//! Production deployments back these traits with a real database; the
//! in-memory implementations here serve development and tests, and double as
//! the stable fallback semantics for search (a linear scan over the caller's
//! sessions) when the storage engine offers no dedicated search function.
//!
//! Every operation filters by `user_id` at the store layer. The HTTP layer
//! performs its own gating, but the store does not trust it — a session id
//! belonging to another user behaves exactly like a missing session.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    attachments::AttachmentStore,
    auth::UserProfile,
    chat::{Annotation, Role},
};

/// Store-layer failures, kept separate from [`crate::error::ApiError`] so
/// implementations stay HTTP-agnostic.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing row, or a row the caller does not own — indistinguishable by
    /// design.
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A chat session row with denormalized rollups.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message_count: u64,
    pub total_tokens: u64,
    pub last_message_preview: String,
    pub last_message_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A stored message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub content_type: String,
    pub total_tokens: u64,
    pub has_attachments: bool,
    pub attachment_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Input shape for [`ConversationStore::append_messages`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMatchClass {
    Title,
    Preview,
    Content,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchMatch {
    pub session_id: String,
    pub title: String,
    #[serde(rename = "match")]
    pub class: SearchMatchClass,
    pub last_message_timestamp: DateTime<Utc>,
}

/// Conversation persistence operations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session_if_missing(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str,
    ) -> StoreResult<()>;

    /// Append messages idempotently (`message.id` is the dedup key), bind
    /// pending attachments to the last user message of the batch, and update
    /// the session rollups.
    async fn append_messages(
        &self,
        session_id: &str,
        user_id: &str,
        messages: Vec<NewMessage>,
        link_attachment_ids: Option<&[String]>,
    ) -> StoreResult<()>;

    async fn persist_annotations(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: &str,
        annotations: &[Annotation],
    ) -> StoreResult<()>;

    async fn read_messages(&self, session_id: &str, user_id: &str)
        -> StoreResult<Vec<MessageRecord>>;

    /// Case-insensitive search over the caller's sessions in three classes
    /// (title, preview, content), newest activity first.
    async fn search_conversations(
        &self,
        user_id: &str,
        pattern: &str,
        limit: usize,
    ) -> StoreResult<Vec<SearchMatch>>;
}

/// Authoritative profile reads and admin ban writes.
#[async_trait]
pub trait AuthSnapshotStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>>;

    async fn set_ban(
        &self,
        user_id: &str,
        banned: bool,
        banned_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ──────────────────────────────────────────────────────────────────────────────

const PREVIEW_CHARS: usize = 120;

/// DashMap-backed [`ConversationStore`]. Single-process only; the search
/// path is the documented linear-scan fallback.
pub struct MemoryConversationStore {
    sessions: DashMap<String, SessionRecord>,
    /// session id → ordered messages.
    messages: DashMap<String, Vec<MessageRecord>>,
    /// message id → annotations.
    annotations: DashMap<String, Vec<Annotation>>,
    attachments: Arc<dyn AttachmentStore>,
}

impl MemoryConversationStore {
    pub fn new(attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            messages: DashMap::new(),
            annotations: DashMap::new(),
            attachments,
        }
    }

    fn owned_session(&self, session_id: &str, user_id: &str) -> StoreResult<SessionRecord> {
        match self.sessions.get(session_id) {
            Some(s) if s.user_id == user_id => Ok(s.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    /// Stored annotations for a message. Test and export surface.
    pub fn annotations_for(&self, message_id: &str) -> Vec<Annotation> {
        self.annotations
            .get(message_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_session_if_missing(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str,
    ) -> StoreResult<()> {
        if let Some(existing) = self.sessions.get(session_id) {
            // A session id claimed by another user is unusable by this one.
            if existing.user_id != user_id {
                return Err(StoreError::NotFound);
            }
            return Ok(());
        }
        let now = Utc::now();
        self.sessions.insert(
            session_id.to_string(),
            SessionRecord {
                id: session_id.to_string(),
                user_id: user_id.to_string(),
                title: title.to_string(),
                message_count: 0,
                total_tokens: 0,
                last_message_preview: String::new(),
                last_message_timestamp: now,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn append_messages(
        &self,
        session_id: &str,
        user_id: &str,
        messages: Vec<NewMessage>,
        link_attachment_ids: Option<&[String]>,
    ) -> StoreResult<()> {
        self.owned_session(session_id, user_id)?;

        // Drop duplicates up front so the attachment linking below only ever
        // targets a message that will actually be stored. The map guard is
        // not held across any await point.
        let existing: std::collections::HashSet<String> = self
            .messages
            .get(session_id)
            .map(|m| m.iter().map(|x| x.id.clone()).collect())
            .unwrap_or_default();
        let messages: Vec<NewMessage> = messages
            .into_iter()
            .filter(|m| !existing.contains(&m.id))
            .collect();

        let link_target = link_attachment_ids.filter(|ids| !ids.is_empty()).and_then(|_| {
            messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.id.clone())
        });
        let linked = match &link_target {
            Some(target) => self
                .attachments
                .link_to_message(user_id, session_id, target, link_attachment_ids.unwrap_or(&[]))
                .await
                .map_err(StoreError::Internal)?,
            None => 0,
        };

        let mut stored = self.messages.entry(session_id.to_string()).or_default();
        let mut appended = 0u64;
        let mut appended_tokens = 0u64;
        let mut last: Option<(String, DateTime<Utc>)> = None;

        for message in messages {
            if stored.iter().any(|m| m.id == message.id) {
                continue;
            }

            let is_link_target = link_target.as_deref() == Some(message.id.as_str());
            let now = Utc::now();
            appended += 1;
            appended_tokens += message.total_tokens;
            last = Some((preview_of(&message.content), now));
            stored.push(MessageRecord {
                id: message.id,
                session_id: session_id.to_string(),
                role: message.role,
                content: message.content,
                content_type: "markdown".to_string(),
                total_tokens: message.total_tokens,
                has_attachments: is_link_target && linked > 0,
                attachment_count: if is_link_target { linked } else { 0 },
                created_at: now,
            });
        }
        drop(stored);

        if appended > 0 {
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.message_count += appended;
                session.total_tokens += appended_tokens;
                if let Some((preview, at)) = last {
                    session.last_message_preview = preview;
                    session.last_message_timestamp = at;
                }
            }
        }
        Ok(())
    }

    async fn persist_annotations(
        &self,
        user_id: &str,
        session_id: &str,
        message_id: &str,
        annotations: &[Annotation],
    ) -> StoreResult<()> {
        self.owned_session(session_id, user_id)?;
        let belongs = self
            .messages
            .get(session_id)
            .is_some_and(|m| m.iter().any(|msg| msg.id == message_id));
        if !belongs {
            return Err(StoreError::NotFound);
        }
        self.annotations
            .insert(message_id.to_string(), annotations.to_vec());
        Ok(())
    }

    async fn read_messages(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> StoreResult<Vec<MessageRecord>> {
        self.owned_session(session_id, user_id)?;
        Ok(self
            .messages
            .get(session_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn search_conversations(
        &self,
        user_id: &str,
        pattern: &str,
        limit: usize,
    ) -> StoreResult<Vec<SearchMatch>> {
        let needle = pattern.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<SearchMatch> = Vec::new();
        for session in self.sessions.iter().filter(|s| s.user_id == user_id) {
            let class = if session.title.to_lowercase().contains(&needle) {
                Some(SearchMatchClass::Title)
            } else if session.last_message_preview.to_lowercase().contains(&needle) {
                Some(SearchMatchClass::Preview)
            } else {
                let in_content = self.messages.get(&session.id).is_some_and(|msgs| {
                    msgs.iter().any(|m| m.content.to_lowercase().contains(&needle))
                });
                in_content.then_some(SearchMatchClass::Content)
            };

            if let Some(class) = class {
                matches.push(SearchMatch {
                    session_id: session.id.clone(),
                    title: session.title.clone(),
                    class,
                    last_message_timestamp: session.last_message_timestamp,
                });
            }
        }

        matches.sort_by(|a, b| b.last_message_timestamp.cmp(&a.last_message_timestamp));
        matches.truncate(limit);
        Ok(matches)
    }
}

/// DashMap-backed [`AuthSnapshotStore`].
#[derive(Default)]
pub struct MemoryAuthStore {
    profiles: DashMap<String, UserProfile>,
}

impl MemoryAuthStore {
    /// Seed or replace a profile. Development/test surface.
    pub fn upsert_profile(&self, profile: UserProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl AuthSnapshotStore for MemoryAuthStore {
    async fn load_profile(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }

    async fn set_ban(
        &self,
        user_id: &str,
        banned: bool,
        banned_until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut profile = self.profiles.get_mut(user_id).ok_or(StoreError::NotFound)?;
        profile.banned = banned;
        profile.banned_until = banned_until;
        Ok(())
    }
}
