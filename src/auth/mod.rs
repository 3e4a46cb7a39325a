//! Authentication domain types shared across the middleware stack.
//!
//! The flow: the resolver ([`resolver`]) turns request credentials into an
//! [`AuthContext`]; the snapshot cache ([`snapshot`]) provides the per-user
//! tier/ban view backing it; the flag builder ([`features`]) derives the
//! tier's capabilities. The context is built once per request and passed by
//! value thereafter — nothing downstream mutates it.

pub mod features;
pub mod resolver;
pub mod snapshot;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::features::FeatureFlags;

/// Subscription tier of a caller. `Anonymous` iff no authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Anonymous,
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anonymous => "anonymous",
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        })
    }
}

/// Account type carried by the snapshot; admin unlocks the `/admin` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    User,
    Admin,
}

/// Authoritative per-user profile, materialized on first authenticated
/// request and refreshed through the snapshot cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub tier: Tier,
    pub account_type: AccountType,
    pub banned: bool,
    /// When set, the ban lifts automatically at this instant.
    pub banned_until: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Whether the ban is in effect at `now`. A `banned_until` in the past
    /// means the ban has lapsed even if the flag is still set.
    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.banned && self.banned_until.map_or(true, |until| until > now)
    }
}

/// The endpoint's authentication requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Anonymous callers welcome.
    Public,
    /// Authentication used when present; invalid credentials degrade to
    /// anonymous instead of failing.
    Enhanced,
    /// Authentication required.
    Protected,
}

/// Minimal identity of the authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

/// Immutable per-request authentication context.
///
/// `features` is never absent: anonymous requests carry the anonymous tier's
/// flag set.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub access_level: AccessLevel,
    pub is_authenticated: bool,
    pub user: Option<AuthUser>,
    pub profile: Option<UserProfile>,
    pub features: FeatureFlags,
    /// Taken from `X-Request-ID` when the caller provides one, otherwise
    /// freshly generated.
    pub request_id: String,
    /// Salted, truncated hash of the peer address; the rate-limit subject
    /// for anonymous callers.
    pub ip_hash: String,
}

impl AuthContext {
    pub fn tier(&self) -> Tier {
        self.profile.as_ref().map(|p| p.tier).unwrap_or_default()
    }

    /// Rate-limit subject: stable per user, per hashed IP otherwise.
    pub fn subject(&self) -> String {
        match &self.user {
            Some(user) => format!("user:{}", user.id),
            None => format!("ip:{}", self.ip_hash),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.profile
            .as_ref()
            .is_some_and(|p| p.account_type == AccountType::Admin)
    }
}

/// Salted, truncated IP hash used to bucket anonymous callers without
/// retaining raw addresses.
pub fn hash_ip(salt: &str, ip: IpAddr) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(ip.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn profile(banned: bool, until: Option<DateTime<Utc>>) -> UserProfile {
        UserProfile {
            id: "u1".into(),
            email: "u1@example.com".into(),
            tier: Tier::Free,
            account_type: AccountType::User,
            banned,
            banned_until: until,
        }
    }

    #[test]
    fn tier_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Tier::Enterprise).unwrap(), "\"enterprise\"");
        let tier: Tier = serde_json::from_str("\"pro\"").unwrap();
        assert_eq!(tier, Tier::Pro);
    }

    #[test]
    fn permanent_ban_has_no_expiry() {
        let now = Utc::now();
        assert!(profile(true, None).is_banned_at(now));
    }

    #[test]
    fn timed_ban_lapses_after_expiry() {
        let now = Utc::now();
        let past = now - chrono::Duration::hours(1);
        let future = now + chrono::Duration::hours(1);
        assert!(!profile(true, Some(past)).is_banned_at(now));
        assert!(profile(true, Some(future)).is_banned_at(now));
    }

    #[test]
    fn unbanned_profile_is_never_banned() {
        let now = Utc::now();
        let future = now + chrono::Duration::hours(1);
        assert!(!profile(false, Some(future)).is_banned_at(now));
    }

    #[test]
    fn ip_hash_is_salted_and_truncated() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let a = hash_ip("salt-one", ip);
        let b = hash_ip("salt-two", ip);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b, "different salts must produce different hashes");
        assert_eq!(a, hash_ip("salt-one", ip), "hash must be stable");
        assert!(!a.contains("203"), "raw address must not survive hashing");
    }
}
