//! Sliding-window rate limiting on the shared cache.
//!
//! One bucket per `(cost class, subject)` under
//! `rate_limit:{class}:{scope}:{subject}`, where the scope is the class's
//! cost name (`chat`, `storage`, `crud`, `admin`). All endpoints of a class
//! share the subject's counter, so cheap CRUD calls cannot be combined to
//! subvert the chat budget.
//!
//! Each check is a single atomic MULTI/EXEC pipeline on a sorted set:
//! drop entries older than the window, append now, count, refresh the TTL.
//! Over the limit, the just-appended entry is removed again — a rejected
//! request must not consume budget, and the bucket count never exceeds the
//! limit once a check completes.
//!
//! When the shared cache is unreachable the check degrades to an in-process
//! window with identical semantics and logs `degraded = true`. A
//! single-instance deployment loses nothing; a fleet temporarily enforces
//! per-instance limits, which is the documented failure mode.

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::Tier,
    cache::SharedCache,
    config::{RateClass, RateLimitsConfig},
};

/// Outcome of a rate-limit check, carrying everything the response headers
/// need.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the window after this one.
    pub remaining: u32,
    /// Epoch seconds at which the oldest in-window entry expires.
    pub reset_epoch_secs: u64,
    /// Seconds to wait before retrying. Zero when allowed.
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    cache: SharedCache,
    limits: RateLimitsConfig,
    /// Per-bucket timestamp lists (ms) for the degraded path.
    fallback: DashMap<String, Vec<u64>>,
}

impl RateLimiter {
    pub fn new(cache: SharedCache, limits: RateLimitsConfig) -> Self {
        Self { cache, limits, fallback: DashMap::new() }
    }

    pub fn limit_for(&self, class: RateClass, tier: Tier) -> u32 {
        self.limits.limit_for(class, tier)
    }

    pub fn window_secs(&self) -> u64 {
        self.limits.window_secs
    }

    fn scope_of(class: RateClass) -> &'static str {
        match class {
            RateClass::A => "chat",
            RateClass::B => "storage",
            RateClass::C => "crud",
            RateClass::D => "admin",
        }
    }

    fn key(class: RateClass, subject: &str) -> String {
        format!("rate_limit:{class}:{}:{subject}", Self::scope_of(class))
    }

    /// Check and consume one slot for `subject` in the given class.
    pub async fn check(&self, class: RateClass, tier: Tier, subject: &str) -> RateDecision {
        let limit = self.limit_for(class, tier);
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let window_ms = self.limits.window_secs * 1_000;

        if limit == 0 {
            // Class not available to this tier at all.
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_epoch_secs: (now_ms + window_ms) / 1_000,
                retry_after_secs: self.limits.window_secs,
            };
        }

        let key = Self::key(class, subject);
        match self.check_shared(&key, now_ms, window_ms, limit).await {
            Some(decision) => decision,
            None => {
                if self.cache.is_configured() {
                    warn!(%key, degraded = true, "rate-limit check fell back to the in-process window");
                }
                self.check_fallback(&key, now_ms, window_ms, limit)
            }
        }
    }

    /// Shared-cache path. `None` means the cache could not serve the check.
    async fn check_shared(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Option<RateDecision> {
        let mut conn = self.cache.connection().await?;
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let cutoff = now_ms.saturating_sub(window_ms);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE").arg(key).arg(0).arg(cutoff).ignore()
            .cmd("ZADD").arg(key).arg(now_ms).arg(&member).ignore()
            .cmd("ZCARD").arg(key)
            .cmd("EXPIRE").arg(key).arg(self.limits.window_secs).ignore();

        let (count,): (u64,) = match pipe.query_async(&mut conn).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, error = %e, degraded = true, "rate-limit pipeline failed");
                return None;
            }
        };

        if count <= limit as u64 {
            let reset = (now_ms + window_ms) / 1_000;
            return Some(RateDecision {
                allowed: true,
                limit,
                remaining: limit - count as u32,
                reset_epoch_secs: reset,
                retry_after_secs: 0,
            });
        }

        // Over the limit: withdraw our entry and report when the earliest
        // in-window request falls out.
        let _: Result<i64, _> = redis::cmd("ZREM")
            .arg(key)
            .arg(&member)
            .query_async(&mut conn)
            .await;
        let earliest: Vec<(String, u64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        let earliest_ms = earliest.first().map(|(_, score)| *score).unwrap_or(now_ms);
        let retry_ms = (earliest_ms + window_ms).saturating_sub(now_ms);

        Some(RateDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_epoch_secs: (earliest_ms + window_ms) / 1_000,
            retry_after_secs: retry_ms.div_ceil(1_000).max(1),
        })
    }

    /// In-process window with the same semantics as the shared path.
    fn check_fallback(&self, key: &str, now_ms: u64, window_ms: u64, limit: u32) -> RateDecision {
        let mut entries = self.fallback.entry(key.to_string()).or_default();
        window_check(entries.value_mut(), now_ms, window_ms, limit)
    }
}

/// Core window arithmetic, shared by the fallback path and the tests.
fn window_check(entries: &mut Vec<u64>, now_ms: u64, window_ms: u64, limit: u32) -> RateDecision {
    let cutoff = now_ms.saturating_sub(window_ms);
    entries.retain(|&t| t > cutoff);

    if (entries.len() as u32) < limit {
        entries.push(now_ms);
        let earliest = *entries.first().unwrap_or(&now_ms);
        return RateDecision {
            allowed: true,
            limit,
            remaining: limit - entries.len() as u32,
            reset_epoch_secs: (earliest + window_ms) / 1_000,
            retry_after_secs: 0,
        };
    }

    let earliest = *entries.first().unwrap_or(&now_ms);
    let retry_ms = (earliest + window_ms).saturating_sub(now_ms);
    RateDecision {
        allowed: false,
        limit,
        remaining: 0,
        reset_epoch_secs: (earliest + window_ms) / 1_000,
        retry_after_secs: retry_ms.div_ceil(1_000).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(SharedCache::disabled(), RateLimitsConfig::default())
    }

    const WINDOW_MS: u64 = 3_600_000;

    // -----------------------------------------------------------------------
    // window_check — pure arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let mut entries = Vec::new();
        let now = 1_000_000;

        for i in 0..10 {
            let decision = window_check(&mut entries, now + i, WINDOW_MS, 10);
            assert!(decision.allowed, "request {i} should be allowed");
        }
        let decision = window_check(&mut entries, now + 10, WINDOW_MS, 10);
        assert!(!decision.allowed, "11th request must be rejected");
        assert!(decision.retry_after_secs >= 1);
        assert!(decision.retry_after_secs <= 3_600);
        // A rejected check consumed no budget.
        assert_eq!(entries.len(), 10);
    }

    #[test]
    fn remaining_counts_down() {
        let mut entries = Vec::new();
        let d1 = window_check(&mut entries, 0, WINDOW_MS, 3);
        let d2 = window_check(&mut entries, 1, WINDOW_MS, 3);
        assert_eq!(d1.remaining, 2);
        assert_eq!(d2.remaining, 1);
    }

    #[test]
    fn entries_age_out_of_the_window() {
        let mut entries = Vec::new();
        let start = 1_000_000;
        for i in 0..5 {
            window_check(&mut entries, start + i, WINDOW_MS, 5);
        }
        assert!(!window_check(&mut entries, start + 10, WINDOW_MS, 5).allowed);

        // One window later the oldest entries have expired.
        let later = start + WINDOW_MS + 100;
        let decision = window_check(&mut entries, later, WINDOW_MS, 5);
        assert!(decision.allowed);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn retry_after_tracks_the_earliest_entry() {
        let mut entries = Vec::new();
        window_check(&mut entries, 0, WINDOW_MS, 1);
        // Rejected halfway through the window: half the window remains.
        let decision = window_check(&mut entries, WINDOW_MS / 2, WINDOW_MS, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 1_800);
    }

    // -----------------------------------------------------------------------
    // RateLimiter — fallback path (no cache configured)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn enforces_class_a_anonymous_limit() {
        let limiter = limiter();
        for _ in 0..10 {
            let d = limiter.check(RateClass::A, Tier::Anonymous, "ip:abc").await;
            assert!(d.allowed);
            assert_eq!(d.limit, 10);
        }
        let d = limiter.check(RateClass::A, Tier::Anonymous, "ip:abc").await;
        assert!(!d.allowed);
        assert!(d.retry_after_secs >= 1 && d.retry_after_secs <= 3_600);
    }

    #[tokio::test]
    async fn subjects_have_independent_buckets() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.check(RateClass::A, Tier::Anonymous, "ip:one").await;
        }
        assert!(!limiter.check(RateClass::A, Tier::Anonymous, "ip:one").await.allowed);
        assert!(limiter.check(RateClass::A, Tier::Anonymous, "ip:two").await.allowed);
    }

    #[tokio::test]
    async fn classes_have_independent_budgets() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.check(RateClass::A, Tier::Anonymous, "ip:abc").await;
        }
        assert!(!limiter.check(RateClass::A, Tier::Anonymous, "ip:abc").await.allowed);
        // Class C budget untouched by class A exhaustion.
        assert!(limiter.check(RateClass::C, Tier::Anonymous, "ip:abc").await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_rejects_without_consuming() {
        let limiter = limiter();
        let d = limiter.check(RateClass::D, Tier::Free, "user:u1").await;
        assert!(!d.allowed);
        assert_eq!(d.limit, 0);
        assert_eq!(d.retry_after_secs, 3_600);
    }

    #[tokio::test]
    async fn enterprise_reaches_admin_class() {
        let limiter = limiter();
        let d = limiter.check(RateClass::D, Tier::Enterprise, "user:u1").await;
        assert!(d.allowed);
        assert_eq!(d.limit, 100);
    }

    #[test]
    fn bucket_keys_separate_class_and_subject() {
        assert_eq!(
            RateLimiter::key(RateClass::A, "user:42"),
            "rate_limit:A:chat:user:42"
        );
        assert_eq!(
            RateLimiter::key(RateClass::D, "ip:beef"),
            "rate_limit:D:admin:ip:beef"
        );
    }
}
