//! Shared application state injected into every request handler.
//!
//! [`AppState`] owns the long-lived pieces: the atomically-swappable config,
//! the shared-cache clients, the model catalog, the Router client, the store
//! handles, and the usage log. Handlers receive it as
//! `State<Arc<AppState>>`.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use axum::http::HeaderMap;

use crate::{
    attachments::{AttachmentStore, BlobStore, MemoryAttachmentStore, MemoryBlobStore},
    auth::{resolver::AuthResolver, snapshot::AuthSnapshotCache, AccessLevel, AuthContext},
    cache::SharedCache,
    catalog::ModelCatalog,
    config::Config,
    error::ApiError,
    ratelimit::RateLimiter,
    store::{AuthSnapshotStore, ConversationStore, MemoryAuthStore, MemoryConversationStore},
    upstream::RouterClient,
    usage::UsageLog,
};

/// The persistence backends behind the store traits.
///
/// The in-memory set serves development, tests, and single-instance
/// deployments; production deployments substitute implementations backed by
/// their database and blob storage.
pub struct Stores {
    pub conversations: Arc<dyn ConversationStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<dyn AuthSnapshotStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let attachments = Arc::new(MemoryAttachmentStore::default());
        Self {
            conversations: Arc::new(MemoryConversationStore::new(attachments.clone())),
            attachments,
            blobs: Arc::new(MemoryBlobStore::default()),
            auth: Arc::new(MemoryAuthStore::default()),
        }
    }
}

pub struct AppState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file on disk — used by the hot-reload task.
    pub config_path: PathBuf,
    resolver: AuthResolver,
    pub snapshots: AuthSnapshotCache,
    /// Built once at startup from the initial config. A config hot-reload
    /// does NOT rebuild the limiter; restart to change the matrix.
    pub limiter: RateLimiter,
    pub catalog: ModelCatalog,
    pub router: RouterClient,
    pub conversations: Arc<dyn ConversationStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth_store: Arc<dyn AuthSnapshotStore>,
    pub usage: Arc<UsageLog>,
    /// Gateway start time, surfaced for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, stores: Stores) -> Self {
        let cache = SharedCache::connect(config.cache.url.as_deref());
        let snapshots = AuthSnapshotCache::new(
            cache.clone(),
            stores.auth.clone(),
            config.auth.snapshot_ttl_secs,
        );
        let limiter = RateLimiter::new(cache, config.limits.clone());
        let catalog = ModelCatalog::new(
            config.router.url.clone(),
            config.router.api_key.as_deref(),
            config.catalog.ttl_secs,
        );
        let router = RouterClient::new(
            &config.router.url,
            config.router.api_key.as_deref(),
            config.router.timeout_ms,
        );
        let resolver = AuthResolver::new(
            config.auth.idp_public_key.as_deref(),
            config.auth.session_cookie_name.clone(),
            config.auth.ip_hash_salt.clone(),
            snapshots.clone(),
            Arc::new(config.features.clone()),
        );
        let usage = Arc::new(UsageLog::new(config.gateway.usage_log_capacity));

        Self {
            config_lock: RwLock::new(config),
            config_path,
            resolver,
            snapshots,
            limiter,
            catalog,
            router,
            conversations: stores.conversations,
            attachments: stores.attachments,
            blobs: stores.blobs,
            auth_store: stores.auth,
            usage,
            started_at: Instant::now(),
        }
    }

    /// Snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload
    /// task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Resolve the caller's [`AuthContext`], expanding model wildcards
    /// against the current catalog.
    pub async fn resolve_auth(
        &self,
        headers: &HeaderMap,
        peer_ip: std::net::IpAddr,
        access_level: AccessLevel,
    ) -> Result<AuthContext, ApiError> {
        let snapshot = self.catalog.snapshot().await;
        let ids = snapshot.model_ids();
        self.resolver.resolve(headers, peer_ip, access_level, &ids).await
    }
}
