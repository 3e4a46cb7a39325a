//! Feature-flag derivation.
//!
//! [`build_flags`] is a pure function of the subscription tier and the
//! configured matrix: the same tier always yields the same flags. The model
//! wildcard is expanded against the live catalog at flag-evaluation time so
//! downstream gating works on concrete model ids while still remembering
//! that the caller had unrestricted access.

use crate::{
    auth::Tier,
    config::{FeaturesConfig, TierFeatures},
};

/// The capability set attached to every request context.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFlags {
    pub tier: Tier,
    /// Concrete, ordered model allow-list. When `wildcard` is set this holds
    /// the full active catalog at the time the flags were built.
    pub allowed_models: Vec<String>,
    /// The tier's config carried the `"*"` token: any model, including ones
    /// the catalog has not listed yet, is permitted.
    pub wildcard: bool,
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
    pub max_requests_per_hour: u32,
    pub max_tokens_per_request: u32,
    pub max_attachments_per_message: u32,
}

impl FeatureFlags {
    pub fn permits_model(&self, model_id: &str) -> bool {
        self.wildcard || self.allowed_models.iter().any(|m| m == model_id)
    }

    /// First allowed model — the downgrade target when the requested model
    /// is out of reach and no modality-matched candidate exists.
    pub fn first_allowed_model(&self) -> Option<&str> {
        self.allowed_models.first().map(String::as_str)
    }
}

/// Derive the flag set for a tier, expanding the wildcard against the given
/// active-catalog ids.
///
/// `catalog_model_ids` preserves Router's ordering; an empty slice (catalog
/// not yet fetched) leaves a wildcard tier with an empty concrete list but
/// `wildcard = true`, so gating still admits any model.
pub fn build_flags(
    tier: Tier,
    config: &FeaturesConfig,
    catalog_model_ids: &[String],
) -> FeatureFlags {
    let row: &TierFeatures = config.for_tier(tier);
    let wildcard = row.allowed_models.iter().any(|m| m == "*");
    let allowed_models = if wildcard {
        catalog_model_ids.to_vec()
    } else {
        row.allowed_models.clone()
    };

    FeatureFlags {
        tier,
        allowed_models,
        wildcard,
        can_use_custom_system_prompt: row.can_use_custom_system_prompt,
        can_use_custom_temperature: row.can_use_custom_temperature,
        can_use_attachments: row.can_use_attachments,
        can_use_web_search: row.can_use_web_search,
        can_use_reasoning: row.can_use_reasoning,
        can_use_image_generation: row.can_use_image_generation,
        can_sync_conversations: row.can_sync_conversations,
        can_export_conversations: row.can_export_conversations,
        can_access_analytics: row.can_access_analytics,
        can_bypass_rate_limit: row.can_bypass_rate_limit,
        max_requests_per_hour: row.max_requests_per_hour,
        max_tokens_per_request: row.max_tokens_per_request,
        max_attachments_per_message: row.max_attachments_per_message,
    }
}
