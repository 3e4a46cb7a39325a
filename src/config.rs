//! Configuration types for chat-gateway.
//!
//! Config is loaded once at startup from an optional TOML file, overlaid with
//! process environment variables, and validated before the server opens any
//! ports. Invalid configs are rejected with a clear error rather than
//! silently falling back to defaults.
//!
//! Secrets (`ROUTER_API_KEY`, `IDP_PUBLIC_KEY`, `INTERNAL_SHARED_SECRET`,
//! `IP_HASH_SALT`) are read from the environment only — they never appear in
//! the config file.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//! stream_markers_enabled = false
//!
//! [router]
//! url = "https://openrouter.ai/api/v1"
//!
//! [limits.a]
//! anonymous = 10
//! free = 20
//! pro = 200
//! enterprise = 500
//! ```
//!
//! A `[limits.*]` row or `[features.*]` table replaces the built-in row
//! wholesale when present; see `config.example.toml` for complete rows.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::auth::Tier;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Identity-provider settings (token validation, snapshot TTL).
    #[serde(default)]
    pub auth: AuthConfig,

    /// Shared cache (Redis) settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream Router settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Persistence endpoints consumed through the store traits.
    #[serde(default)]
    pub stores: StoreConfig,

    /// Model catalog refresh settings.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Rate-limit matrix, one row per cost class.
    #[serde(default)]
    pub limits: RateLimitsConfig,

    /// Per-tier feature matrix.
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl Config {
    /// Load from a TOML file (if it exists), overlay environment variables,
    /// and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).context("parsing config TOML")?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the process environment onto the parsed file config.
    ///
    /// Environment always wins over the file so deployments can keep a static
    /// config file and vary per-instance settings.
    pub fn apply_env(&mut self) {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            env(name).and_then(|v| v.parse().ok())
        }
        fn env_bool(name: &str) -> Option<bool> {
            env(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        }

        if let Some(v) = env_parse("GATEWAY_PORT") {
            self.gateway.port = v;
        }
        if let Some(v) = env_bool("STREAM_MARKERS_ENABLED") {
            self.gateway.stream_markers_enabled = v;
        }
        if let Some(v) = env_bool("STREAM_REASONING_ENABLED") {
            self.gateway.stream_reasoning_enabled = v;
        }
        if let Some(v) = env_bool("STREAM_DEBUG") {
            self.gateway.stream_debug = v;
        }
        if let Some(v) = env("INTERNAL_SHARED_SECRET") {
            self.gateway.internal_shared_secret = Some(v);
        }
        if let Some(v) = env("ERROR_SINK_DSN") {
            self.gateway.error_sink_dsn = Some(v);
        }

        if let Some(v) = env("IDP_URL") {
            self.auth.idp_url = v;
        }
        if let Some(v) = env("IDP_PUBLIC_KEY") {
            self.auth.idp_public_key = Some(v);
        }
        if let Some(v) = env_parse("AUTH_SNAPSHOT_TTL_SECONDS") {
            self.auth.snapshot_ttl_secs = v;
        }
        if let Some(v) = env("SESSION_COOKIE_NAME") {
            self.auth.session_cookie_name = v;
        }
        if let Some(v) = env("IP_HASH_SALT") {
            self.auth.ip_hash_salt = v;
        }

        if let Some(v) = env("CACHE_URL") {
            self.cache.url = Some(v);
        }
        if let Some(v) = env("ROUTER_URL") {
            self.router.url = v;
        }
        if let Some(v) = env("ROUTER_API_KEY") {
            self.router.api_key = Some(v);
        }
        if let Some(v) = env("STORE_URL") {
            self.stores.store_url = Some(v);
        }
        if let Some(v) = env("BLOB_URL") {
            self.stores.blob_url = Some(v);
        }
        if let Some(v) = env_parse("MODEL_CATALOG_TTL_SECONDS") {
            self.catalog.ttl_secs = v;
        }

        if let Some(raw) = env("RATE_LIMITS_JSON") {
            match serde_json::from_str::<RateLimitsOverride>(&raw) {
                Ok(over) => self.limits.apply_override(over),
                Err(e) => {
                    tracing::warn!(error = %e, "RATE_LIMITS_JSON is not valid JSON — ignoring override")
                }
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.router.url.is_empty(), "router.url must be set");
        anyhow::ensure!(
            self.limits.window_secs > 0,
            "limits.window_secs must be positive"
        );
        anyhow::ensure!(
            self.auth.snapshot_ttl_secs > 0,
            "auth.snapshot_ttl_secs must be positive"
        );
        anyhow::ensure!(
            self.catalog.ttl_secs > 0,
            "catalog.ttl_secs must be positive"
        );

        // Downgrade targets require at least one concrete model for tiers
        // without wildcard access.
        for tier in [Tier::Anonymous, Tier::Free, Tier::Pro, Tier::Enterprise] {
            let f = self.features.for_tier(tier);
            anyhow::ensure!(
                !f.allowed_models.is_empty(),
                "features.{tier}: allowed_models must not be empty",
            );
        }
        Ok(())
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client-facing API (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Hard per-request deadline, streaming included (default: 300 s).
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Forward progressive marker lines on streaming responses.
    /// Off by default in new deployments; the terminal envelope always
    /// carries the final annotation set regardless.
    #[serde(default)]
    pub stream_markers_enabled: bool,

    /// Forward reasoning deltas to callers whose tier permits reasoning.
    /// On by default — the tier gate already restricts who receives them;
    /// this is the kill switch.
    #[serde(default = "defaults::stream_reasoning_enabled")]
    pub stream_reasoning_enabled: bool,

    /// Emit extra structured logs for streaming (chunk sizes, timing).
    /// Never alters bytes on the wire.
    #[serde(default)]
    pub stream_debug: bool,

    /// Number of recent usage events kept in memory for the internal API.
    #[serde(default = "defaults::usage_log_capacity")]
    pub usage_log_capacity: usize,

    /// Shared secret required by `/internal/*` endpoints. Read from
    /// `INTERNAL_SHARED_SECRET`; when unset the internal endpoints reject
    /// every request.
    #[serde(skip)]
    pub internal_shared_secret: Option<String>,

    /// Structured-error sink DSN. Accepted and logged; wiring an external
    /// sink is an operator concern.
    #[serde(skip)]
    pub error_sink_dsn: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty gateway config must deserialize")
    }
}

/// Identity-provider and snapshot settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Base URL of the external identity provider (informational; token
    /// validation is local against `idp_public_key`).
    #[serde(default)]
    pub idp_url: String,

    /// PEM-encoded RSA public key used to validate identity tokens.
    /// Read from `IDP_PUBLIC_KEY`. When absent, every presented credential
    /// fails validation (anonymous access still works).
    #[serde(skip)]
    pub idp_public_key: Option<String>,

    /// Auth snapshot TTL in the shared cache (default: 900 s).
    #[serde(default = "defaults::snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,

    /// Name of the platform session cookie checked before the
    /// `Authorization` header.
    #[serde(default = "defaults::session_cookie_name")]
    pub session_cookie_name: String,

    /// Salt mixed into the anonymous IP hash. Read from `IP_HASH_SALT`;
    /// the default only suits single-instance development.
    #[serde(skip, default = "defaults::ip_hash_salt")]
    pub ip_hash_salt: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            idp_url: String::new(),
            idp_public_key: None,
            snapshot_ttl_secs: defaults::snapshot_ttl_secs(),
            session_cookie_name: defaults::session_cookie_name(),
            ip_hash_salt: defaults::ip_hash_salt(),
        }
    }
}

/// Shared cache (Redis) settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Redis connection URL (`CACHE_URL`). When unset the gateway runs with
    /// in-process fallbacks only — fine for development, wrong for a fleet.
    #[serde(default)]
    pub url: Option<String>,
}

/// Upstream Router settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Base URL of the Router API, without a trailing slash.
    #[serde(default = "defaults::router_url")]
    pub url: String,

    /// API key sent as `Authorization: Bearer …`. Read from
    /// `ROUTER_API_KEY` only.
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Connect/request timeout for buffered calls in milliseconds.
    #[serde(default = "defaults::router_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty router config must deserialize")
    }
}

/// Persistence endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Conversation/attachment store URL (`STORE_URL`). The in-memory store
    /// is used when unset.
    #[serde(default)]
    pub store_url: Option<String>,

    /// Blob store URL (`BLOB_URL`) for attachment bytes and signed URLs.
    #[serde(default)]
    pub blob_url: Option<String>,

    /// Lifetime of minted signed attachment URLs (default: 300 s).
    #[serde(default = "defaults::signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty store config must deserialize")
    }
}

/// Model catalog settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Catalog snapshot TTL (default: 300 s).
    #[serde(default = "defaults::catalog_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::catalog_ttl_secs(),
        }
    }
}

/// One row of the rate-limit matrix: a limit per subscription tier.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ClassLimits {
    pub anonymous: u32,
    pub free: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl ClassLimits {
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Endpoint cost classes used solely for rate limiting.
///
/// Class A is the most restrictive because each A-request (a chat
/// completion) is the most expensive to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateClass {
    /// Chat execution.
    A,
    /// Storage / DB access.
    B,
    /// CRUD and listing.
    C,
    /// Admin operations.
    D,
}

impl std::fmt::Display for RateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        })
    }
}

/// The full rate-limit matrix plus the sliding-window length.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitsConfig {
    /// Sliding-window length in seconds (default: 3600).
    #[serde(default = "defaults::window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::class_a")]
    pub a: ClassLimits,
    #[serde(default = "defaults::class_b")]
    pub b: ClassLimits,
    #[serde(default = "defaults::class_c")]
    pub c: ClassLimits,
    #[serde(default = "defaults::class_d")]
    pub d: ClassLimits,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty limits config must deserialize")
    }
}

impl RateLimitsConfig {
    pub fn limit_for(&self, class: RateClass, tier: Tier) -> u32 {
        match class {
            RateClass::A => self.a.for_tier(tier),
            RateClass::B => self.b.for_tier(tier),
            RateClass::C => self.c.for_tier(tier),
            RateClass::D => self.d.for_tier(tier),
        }
    }

    fn apply_override(&mut self, over: RateLimitsOverride) {
        if let Some(w) = over.window_secs {
            self.window_secs = w;
        }
        for (class, row) in over.classes {
            let target = match class {
                RateClass::A => &mut self.a,
                RateClass::B => &mut self.b,
                RateClass::C => &mut self.c,
                RateClass::D => &mut self.d,
            };
            *target = row;
        }
    }
}

/// Shape of the `RATE_LIMITS_JSON` override:
/// `{"window_secs": 3600, "A": {"anonymous": 10, …}, "D": {…}}`.
#[derive(Debug, Deserialize)]
struct RateLimitsOverride {
    window_secs: Option<u64>,
    #[serde(flatten)]
    classes: HashMap<RateClass, ClassLimits>,
}

/// The feature set granted to one subscription tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierFeatures {
    /// Ordered model allow-list. The single entry `"*"` grants every active
    /// catalog model.
    pub allowed_models: Vec<String>,
    pub can_use_custom_system_prompt: bool,
    pub can_use_custom_temperature: bool,
    pub can_use_attachments: bool,
    pub can_use_web_search: bool,
    pub can_use_reasoning: bool,
    pub can_use_image_generation: bool,
    pub can_sync_conversations: bool,
    pub can_export_conversations: bool,
    pub can_access_analytics: bool,
    pub can_bypass_rate_limit: bool,
    /// Advertised hourly chat budget (shown to clients; the limiter enforces
    /// the class-A matrix independently).
    pub max_requests_per_hour: u32,
    pub max_tokens_per_request: u32,
    pub max_attachments_per_message: u32,
}

/// Per-tier feature matrix. Each tier's entry is independently overridable
/// from the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeaturesConfig {
    #[serde(default = "defaults::features_anonymous")]
    pub anonymous: TierFeatures,
    #[serde(default = "defaults::features_free")]
    pub free: TierFeatures,
    #[serde(default = "defaults::features_pro")]
    pub pro: TierFeatures,
    #[serde(default = "defaults::features_enterprise")]
    pub enterprise: TierFeatures,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty features config must deserialize")
    }
}

impl FeaturesConfig {
    pub fn for_tier(&self, tier: Tier) -> &TierFeatures {
        match tier {
            Tier::Anonymous => &self.anonymous,
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

mod defaults {
    use super::TierFeatures;

    pub fn port() -> u16 {
        8080
    }
    pub fn request_timeout_secs() -> u64 {
        300
    }
    pub fn usage_log_capacity() -> usize {
        500
    }
    pub fn stream_reasoning_enabled() -> bool {
        true
    }
    pub fn snapshot_ttl_secs() -> u64 {
        900
    }
    pub fn session_cookie_name() -> String {
        "session_token".into()
    }
    pub fn ip_hash_salt() -> String {
        "chat-gateway-dev-salt".into()
    }
    pub fn router_url() -> String {
        "https://openrouter.ai/api/v1".into()
    }
    pub fn router_timeout_ms() -> u64 {
        30_000
    }
    pub fn signed_url_ttl_secs() -> u64 {
        300
    }
    pub fn catalog_ttl_secs() -> u64 {
        300
    }
    pub fn window_secs() -> u64 {
        3_600
    }

    pub fn class_a() -> super::ClassLimits {
        super::ClassLimits { anonymous: 10, free: 20, pro: 200, enterprise: 500 }
    }
    pub fn class_b() -> super::ClassLimits {
        super::ClassLimits { anonymous: 20, free: 50, pro: 100, enterprise: 200 }
    }
    pub fn class_c() -> super::ClassLimits {
        super::ClassLimits { anonymous: 50, free: 200, pro: 500, enterprise: 1000 }
    }
    pub fn class_d() -> super::ClassLimits {
        super::ClassLimits { anonymous: 0, free: 0, pro: 0, enterprise: 100 }
    }

    fn starter_models() -> Vec<String> {
        vec![
            "mistralai/mistral-small".into(),
            "google/gemma-2-9b-it:free".into(),
        ]
    }

    pub fn features_anonymous() -> TierFeatures {
        TierFeatures {
            allowed_models: starter_models(),
            can_use_custom_system_prompt: false,
            can_use_custom_temperature: false,
            can_use_attachments: false,
            can_use_web_search: false,
            can_use_reasoning: false,
            can_use_image_generation: false,
            can_sync_conversations: false,
            can_export_conversations: false,
            can_access_analytics: false,
            can_bypass_rate_limit: false,
            max_requests_per_hour: 10,
            max_tokens_per_request: 5_000,
            max_attachments_per_message: 0,
        }
    }

    pub fn features_free() -> TierFeatures {
        TierFeatures {
            allowed_models: starter_models(),
            can_sync_conversations: true,
            can_export_conversations: true,
            max_requests_per_hour: 100,
            max_tokens_per_request: 10_000,
            ..features_anonymous()
        }
    }

    pub fn features_pro() -> TierFeatures {
        TierFeatures {
            allowed_models: vec!["*".into()],
            can_use_custom_system_prompt: true,
            can_use_custom_temperature: true,
            can_use_attachments: true,
            can_use_web_search: true,
            max_requests_per_hour: 500,
            max_tokens_per_request: 20_000,
            max_attachments_per_message: 3,
            ..features_free()
        }
    }

    pub fn features_enterprise() -> TierFeatures {
        TierFeatures {
            can_use_reasoning: true,
            can_use_image_generation: true,
            can_access_analytics: true,
            max_requests_per_hour: 2_000,
            max_tokens_per_request: 50_000,
            ..features_pro()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn minimal_config() -> Config {
        let mut config: Config = toml::from_str(
            r#"
            [router]
            url = "https://router.example/api/v1"
            "#,
        )
        .expect("minimal config should parse");
        config.validate().expect("minimal config should be valid");
        config
    }

    // -----------------------------------------------------------------------
    // Parsing & defaults
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn gateway_defaults_are_applied_when_sections_are_missing() {
        let config = minimal_config();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.request_timeout_secs, 300);
        assert_eq!(config.auth.snapshot_ttl_secs, 900);
        assert_eq!(config.catalog.ttl_secs, 300);
        assert_eq!(config.limits.window_secs, 3_600);
        assert!(!config.gateway.stream_markers_enabled);
    }

    #[test]
    fn default_rate_matrix_matches_documented_values() {
        let limits = RateLimitsConfig::default();
        assert_eq!(limits.limit_for(RateClass::A, Tier::Anonymous), 10);
        assert_eq!(limits.limit_for(RateClass::A, Tier::Free), 20);
        assert_eq!(limits.limit_for(RateClass::A, Tier::Pro), 200);
        assert_eq!(limits.limit_for(RateClass::A, Tier::Enterprise), 500);
        assert_eq!(limits.limit_for(RateClass::D, Tier::Pro), 0);
        assert_eq!(limits.limit_for(RateClass::D, Tier::Enterprise), 100);
    }

    #[test]
    fn default_feature_matrix_matches_documented_values() {
        let features = FeaturesConfig::default();
        assert_eq!(features.anonymous.max_tokens_per_request, 5_000);
        assert_eq!(features.free.max_tokens_per_request, 10_000);
        assert_eq!(features.pro.max_tokens_per_request, 20_000);
        assert_eq!(features.enterprise.max_tokens_per_request, 50_000);

        assert_eq!(features.anonymous.max_attachments_per_message, 0);
        assert_eq!(features.pro.max_attachments_per_message, 3);

        assert!(!features.free.can_use_reasoning);
        assert!(features.enterprise.can_use_reasoning);
        assert!(features.pro.can_use_attachments);
        assert!(!features.free.can_use_attachments);

        assert_eq!(features.pro.allowed_models, vec!["*".to_string()]);
        assert!(!features.anonymous.allowed_models.is_empty());
    }

    #[test]
    fn file_can_override_a_single_tier_row() {
        let config: Config = toml::from_str(
            r#"
            [router]
            url = "https://router.example"

            [limits.a]
            anonymous = 1
            free = 2
            pro = 3
            enterprise = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.limit_for(RateClass::A, Tier::Free), 2);
        // Untouched rows keep defaults.
        assert_eq!(config.limits.limit_for(RateClass::B, Tier::Free), 50);
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn validation_rejects_empty_allowed_models() {
        let mut config = minimal_config();
        config.features.anonymous.allowed_models.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_window() {
        let mut config = minimal_config();
        config.limits.window_secs = 0;
        assert!(config.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // Environment overlay
    // -----------------------------------------------------------------------

    #[test]
    fn env_overlay_applies_rate_limits_json() {
        let mut config = minimal_config();
        let over: RateLimitsOverride = serde_json::from_str(
            r#"{"window_secs": 60, "A": {"anonymous": 3, "free": 6, "pro": 9, "enterprise": 12}}"#,
        )
        .unwrap();
        config.limits.apply_override(over);

        assert_eq!(config.limits.window_secs, 60);
        assert_eq!(config.limits.limit_for(RateClass::A, Tier::Pro), 9);
        // Other classes untouched.
        assert_eq!(config.limits.limit_for(RateClass::C, Tier::Pro), 500);
    }

    #[test]
    fn env_overlay_reads_process_variables() {
        // Unique names to avoid cross-test interference.
        std::env::set_var("STREAM_MARKERS_ENABLED", "true");
        std::env::set_var("AUTH_SNAPSHOT_TTL_SECONDS", "120");
        std::env::set_var("ROUTER_API_KEY", "sk-or-test-key");

        let mut config = minimal_config();
        config.apply_env();

        assert!(config.gateway.stream_markers_enabled);
        assert_eq!(config.auth.snapshot_ttl_secs, 120);
        assert_eq!(config.router.api_key.as_deref(), Some("sk-or-test-key"));

        std::env::remove_var("STREAM_MARKERS_ENABLED");
        std::env::remove_var("AUTH_SNAPSHOT_TTL_SECONDS");
        std::env::remove_var("ROUTER_API_KEY");
    }

    #[test]
    fn secrets_are_never_serialized() {
        let mut config = minimal_config();
        config.router.api_key = Some("sk-or-secret".into());
        config.gateway.internal_shared_secret = Some("hunter2".into());
        config.auth.idp_public_key = Some("-----BEGIN PUBLIC KEY-----".into());

        let dumped = toml::to_string(&config).unwrap();
        assert!(!dumped.contains("sk-or-secret"));
        assert!(!dumped.contains("hunter2"));
        assert!(!dumped.contains("BEGIN PUBLIC KEY"));
    }
}
