//! Auth snapshot cache — the hot per-user view consumed on every request.
//!
//! A snapshot is the handful of attributes the middleware needs (tier, ban
//! state, account type), cached in the shared cache under
//! `auth:snapshot:user:{userId}` with a TTL. Reads go cache-through: a miss
//! or a cache outage falls back to the authoritative store and the result is
//! written behind best-effort. No request ever fails because the cache is
//! down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    auth::{AccountType, Tier, UserProfile},
    cache::SharedCache,
    store::{AuthSnapshotStore, StoreResult},
};

/// Bumped whenever the snapshot shape changes; entries with a different
/// version are treated as misses so deployments can roll forward safely.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Cached per-user attributes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSnapshot {
    pub tier: Tier,
    pub account_type: AccountType,
    pub banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub v: u32,
}

impl AuthSnapshot {
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            tier: profile.tier,
            account_type: profile.account_type,
            banned: profile.banned,
            banned_until: profile.banned_until,
            updated_at: Utc::now(),
            v: SNAPSHOT_SCHEMA_VERSION,
        }
    }

    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.banned && self.banned_until.map_or(true, |until| until > now)
    }
}

/// Cache-through reader over the shared cache and the authoritative store.
#[derive(Clone)]
pub struct AuthSnapshotCache {
    cache: SharedCache,
    store: Arc<dyn AuthSnapshotStore>,
    default_ttl_secs: u64,
}

impl AuthSnapshotCache {
    pub fn new(cache: SharedCache, store: Arc<dyn AuthSnapshotStore>, default_ttl_secs: u64) -> Self {
        Self { cache, store, default_ttl_secs }
    }

    fn key(user_id: &str) -> String {
        format!("auth:snapshot:user:{user_id}")
    }

    /// Fetch the snapshot with the default TTL.
    pub async fn get(&self, user_id: &str) -> StoreResult<Option<AuthSnapshot>> {
        self.get_with_ttl(user_id, None).await
    }

    /// Fetch with an explicit TTL override (per-call > configured default).
    pub async fn get_with_ttl(
        &self,
        user_id: &str,
        ttl_secs: Option<u64>,
    ) -> StoreResult<Option<AuthSnapshot>> {
        let key = Self::key(user_id);

        if let Some(snapshot) = self.cache.get_json::<AuthSnapshot>(&key).await {
            if snapshot.v == SNAPSHOT_SCHEMA_VERSION {
                return Ok(Some(snapshot));
            }
            // Stale schema — rebuild below.
        }

        let Some(profile) = self.store.load_profile(user_id).await? else {
            return Ok(None);
        };
        let snapshot = AuthSnapshot::from_profile(&profile);
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        self.cache.set_json(&key, &snapshot, ttl).await;
        Ok(Some(snapshot))
    }

    /// Drop the cached entry. Called on ban/unban, tier change, and account
    /// type change.
    pub async fn invalidate(&self, user_id: &str) {
        self.cache.delete(&Self::key(user_id)).await;
    }
}
