//! Shared cache (Redis) access.
//!
//! [`SharedCache`] wraps a deadpool-redis pool behind a deliberately small
//! API. Every operation is best-effort: a cache outage degrades the gateway
//! (snapshot reads fall back to the store, rate limiting falls back to the
//! in-process window) but never fails a request. Failures are logged once
//! per call with `degraded = true` so operators can alert on them.

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

/// Handle to the shared cache. Cheap to clone; `None` pool means the cache
/// was never configured and every read is a miss.
#[derive(Clone)]
pub struct SharedCache {
    pool: Option<Pool>,
}

impl SharedCache {
    /// Build a pool for the given URL. Connections are established lazily on
    /// first use, so an unreachable cache surfaces as degraded operations
    /// rather than a startup failure.
    pub fn connect(url: Option<&str>) -> Self {
        let pool = url.and_then(|url| {
            match PoolConfig::from_url(url).create_pool(Some(Runtime::Tokio1)) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, degraded = true, "cache pool creation failed — running without shared cache");
                    None
                }
            }
        });
        Self { pool }
    }

    /// A cache handle that always misses. Used by tests and cache-less
    /// development setups.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    /// Checked-out connection for callers that need multi-command atomicity
    /// (the rate limiter's pipeline). `None` when unconfigured or down.
    pub async fn connection(&self) -> Option<deadpool_redis::Connection> {
        let pool = self.pool.as_ref()?;
        match pool.get().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, degraded = true, "cache connection unavailable");
                None
            }
        }
    }

    /// Read and deserialize a JSON value. Any failure is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, degraded = true, "cache GET failed");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // Schema drift between deployments; treat as a miss so the
                // caller re-materializes the entry.
                warn!(key, error = %e, "cache entry failed to deserialize — ignoring");
                None
            }
        }
    }

    /// Serialize and write a JSON value with a TTL. Best-effort.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "cache value failed to serialize");
                return;
            }
        };
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(key, error = %e, degraded = true, "cache SET failed");
        }
    }

    /// Delete a key. Best-effort.
    pub async fn delete(&self, key: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result: Result<(), redis::RedisError> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(e) = result {
            warn!(key, error = %e, degraded = true, "cache DEL failed");
        }
    }
}
