//! Request validation — feature gating, model gating, and the token budget.
//!
//! Validation rewrites the request rather than bouncing it wherever a safe
//! rewrite exists: an out-of-tier model downgrades to the closest allowed
//! one with a warning, and unpermitted system prompts / temperatures are
//! silently dropped. Only the gates whose silent removal would change answer
//! quality behind the caller's back (web search, reasoning, image output)
//! and hard resource limits produce errors.
//!
//! Validation is idempotent: running the enhanced request through again
//! yields the same result.

use crate::{
    auth::AuthContext,
    catalog::{CatalogSnapshot, Modality},
    chat::ChatRequest,
    error::{ApiError, ErrorCode},
};

/// Token-accounting policy, centralized here.
///
/// Text estimates at one token per four characters, rounded up per string.
/// Image blocks cost a flat base plus one 512×512 tile — actual tiling is
/// unknowable at the gateway, so every image counts exactly one tile.
pub const IMAGE_BASE_TOKENS: u64 = 85;
pub const IMAGE_TILE_TOKENS: u64 = 170;

/// Output cap used when the requested model is not in the catalog (wildcard
/// callers may name models Router has not listed yet).
const UNKNOWN_MODEL_OUTPUT_CAP: u64 = 8_192;

/// The outcome of validation: a rewritten request plus derived budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub request: ChatRequest,
    /// Final model id after any downgrade.
    pub model: String,
    pub max_output_tokens: u64,
    pub estimated_input_tokens: u64,
    pub warnings: Vec<String>,
}

pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn estimate_image_tokens(count: u64) -> u64 {
    count * (IMAGE_BASE_TOKENS + IMAGE_TILE_TOKENS)
}

/// Estimated input tokens for the whole request: message text, inline image
/// blocks, referenced attachments, and the system prompt.
pub fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    let mut total = 0;
    for message in &request.messages {
        for part in message.content.text_parts() {
            total += estimate_text_tokens(part);
        }
        total += estimate_image_tokens(message.content.image_count() as u64);
    }
    if let Some(prompt) = &request.system_prompt {
        total += estimate_text_tokens(prompt);
    }
    let attachment_count = request.attachment_ids.as_deref().map_or(0, |ids| ids.len());
    total += estimate_image_tokens(attachment_count as u64);
    total
}

/// Apply feature flags, model gating, and the token budget.
pub fn validate(
    request: ChatRequest,
    context: &AuthContext,
    catalog: &CatalogSnapshot,
) -> Result<ValidatedRequest, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("`messages` must not be empty."));
    }

    let features = &context.features;
    let mut request = request;
    let mut warnings = Vec::new();

    // -- Model gating -------------------------------------------------------
    let model = match request.model.as_deref().filter(|m| !m.is_empty()) {
        Some(requested) if features.permits_model(requested) => requested.to_string(),
        Some(requested) => {
            let downgraded = downgrade_target(requested, features, catalog).ok_or_else(|| {
                ApiError::new(
                    ErrorCode::ModelUnavailable,
                    "No model is available to this account.",
                )
            })?;
            warnings.push(format!("model downgraded: `{requested}` -> `{downgraded}`"));
            downgraded
        }
        None => features
            .first_allowed_model()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::ModelUnavailable,
                    "No model is available to this account.",
                )
            })?
            .to_string(),
    };
    request.model = Some(model.clone());

    // -- Feature gating -----------------------------------------------------
    if request.system_prompt.is_some() && !features.can_use_custom_system_prompt {
        request.system_prompt = None;
    }
    if request.temperature.is_some() && !features.can_use_custom_temperature {
        request.temperature = None;
    }
    if request.web_search && !features.can_use_web_search {
        return Err(ApiError::feature_not_available("webSearch"));
    }
    if request.reasoning.is_some() && !features.can_use_reasoning {
        return Err(ApiError::feature_not_available("reasoning"));
    }
    let produces_images = catalog
        .classify(&model)
        .is_some_and(|c| c.multimodal_output);
    if produces_images && !features.can_use_image_generation {
        return Err(ApiError::feature_not_available("imageGeneration"));
    }

    // -- Attachment gating --------------------------------------------------
    let attachment_count = request.attachment_ids.as_deref().map_or(0, |ids| ids.len());
    if attachment_count > 0 {
        if !features.can_use_attachments {
            return Err(ApiError::feature_not_available("attachments"));
        }
        if attachment_count > features.max_attachments_per_message as usize {
            return Err(ApiError::new(
                ErrorCode::AttachmentLimit,
                format!(
                    "At most {} attachments per message on your plan.",
                    features.max_attachments_per_message
                ),
            ));
        }
        let accepts_images = catalog
            .classify(&model)
            .is_some_and(|c| c.multimodal_input);
        if !accepts_images {
            return Err(ApiError::new(
                ErrorCode::AttachmentInvalid,
                "Attachment rejected: the selected model does not accept image input.",
            ));
        }
    }

    // -- Token budget -------------------------------------------------------
    let estimated_input_tokens = estimate_request_tokens(&request);
    let model_input_limit = catalog
        .token_limits(&model)
        .map(|l| l.max_input_tokens)
        .unwrap_or(u64::MAX);
    let budget = (features.max_tokens_per_request as u64).min(model_input_limit);
    if estimated_input_tokens > budget {
        return Err(ApiError::new(
            ErrorCode::TokenLimitExceeded,
            format!("Request is too large: ~{estimated_input_tokens} tokens against a budget of {budget}."),
        ));
    }

    let max_output_tokens = catalog
        .token_limits(&model)
        .map(|l| l.max_output_tokens)
        .unwrap_or(UNKNOWN_MODEL_OUTPUT_CAP);

    Ok(ValidatedRequest {
        request,
        model,
        max_output_tokens,
        estimated_input_tokens,
        warnings,
    })
}

/// Pick the first allowed model sharing the requested model's input
/// modalities; if the requested model is unknown (or nothing matches), the
/// first allowed model wins.
fn downgrade_target(
    requested: &str,
    features: &crate::auth::features::FeatureFlags,
    catalog: &CatalogSnapshot,
) -> Option<String> {
    let wanted: Vec<Modality> = catalog
        .get(requested)
        .map(|m| m.input_modalities.clone())
        .unwrap_or_else(|| vec![Modality::Text]);

    let matching = features.allowed_models.iter().find(|candidate| {
        catalog
            .get(candidate)
            .is_some_and(|m| wanted.iter().all(|w| m.input_modalities.contains(w)))
    });
    matching
        .cloned()
        .or_else(|| features.first_allowed_model().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessLevel, AuthContext, AuthUser, Tier};
    use crate::catalog::ModelDescriptor;
    use crate::chat::{ChatMessage, MessageContent, ReasoningEffort, ReasoningOptions, Role};
    use crate::config::FeaturesConfig;
    use serde_json::json;

    fn descriptor(id: &str, images: bool, context_window: u64) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            display_name: id.into(),
            input_modalities: if images {
                vec![Modality::Text, Modality::Image]
            } else {
                vec![Modality::Text]
            },
            output_modalities: vec![Modality::Text],
            context_window,
            max_output_tokens: Some(4_096),
            price_per_k_input: 0.001,
            price_per_k_output: 0.002,
            supports_reasoning: true,
            free_variant: false,
            deprecated: false,
        }
    }

    fn test_catalog() -> CatalogSnapshot {
        CatalogSnapshot::for_tests(vec![
            descriptor("mistralai/mistral-small", false, 32_000),
            descriptor("google/gemma-2-9b-it:free", false, 8_192),
            descriptor("anthropic/claude-sonnet", true, 200_000),
            descriptor("anthropic/claude-3-opus", true, 200_000),
        ])
    }

    fn context(tier: Tier) -> AuthContext {
        let catalog = test_catalog();
        let ids: Vec<String> = catalog.model_ids();
        AuthContext {
            access_level: AccessLevel::Enhanced,
            is_authenticated: tier != Tier::Anonymous,
            user: (tier != Tier::Anonymous).then(|| AuthUser {
                id: "u1".into(),
                email: "u1@example.com".into(),
            }),
            profile: None,
            features: crate::auth::features::build_flags(tier, &FeaturesConfig::default(), &ids),
            request_id: "req".into(),
            ip_hash: "hash".into(),
        }
    }

    fn simple_request(model: Option<&str>) -> ChatRequest {
        serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }],
            "model": model,
        }))
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Estimator
    // -----------------------------------------------------------------------

    #[test]
    fn text_tokens_round_up_per_string() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn image_blocks_cost_base_plus_one_tile() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "1234" },
                    { "type": "image_url", "image_url": { "url": "x" } },
                ],
            }],
        }))
        .unwrap();
        assert_eq!(estimate_request_tokens(&request), 1 + 85 + 170);
    }

    // -----------------------------------------------------------------------
    // Model gating
    // -----------------------------------------------------------------------

    #[test]
    fn anonymous_request_for_premium_model_downgrades_with_warning() {
        let result = validate(
            simple_request(Some("anthropic/claude-3-opus")),
            &context(Tier::Anonymous),
            &test_catalog(),
        )
        .unwrap();

        assert_eq!(result.model, "mistralai/mistral-small");
        assert!(result.warnings.iter().any(|w| w.contains("model downgraded")));
        assert_eq!(result.request.model.as_deref(), Some("mistralai/mistral-small"));
    }

    #[test]
    fn allowed_model_passes_unchanged() {
        let result = validate(
            simple_request(Some("google/gemma-2-9b-it:free")),
            &context(Tier::Anonymous),
            &test_catalog(),
        )
        .unwrap();
        assert_eq!(result.model, "google/gemma-2-9b-it:free");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn wildcard_tier_keeps_unknown_models() {
        let result = validate(
            simple_request(Some("vendor/unknown")),
            &context(Tier::Enterprise),
            &test_catalog(),
        )
        .unwrap();
        assert_eq!(result.model, "vendor/unknown");
        assert!(result.warnings.is_empty());
        // Unknown models use the fallback output cap.
        assert_eq!(result.max_output_tokens, UNKNOWN_MODEL_OUTPUT_CAP);
    }

    #[test]
    fn missing_model_defaults_to_first_allowed() {
        let result =
            validate(simple_request(None), &context(Tier::Anonymous), &test_catalog()).unwrap();
        assert_eq!(result.model, "mistralai/mistral-small");
    }

    #[test]
    fn validation_is_idempotent() {
        let first = validate(
            simple_request(Some("anthropic/claude-3-opus")),
            &context(Tier::Anonymous),
            &test_catalog(),
        )
        .unwrap();
        let second = validate(first.request.clone(), &context(Tier::Anonymous), &test_catalog())
            .unwrap();
        assert_eq!(first.request, second.request);
        assert_eq!(first.model, second.model);
        assert!(second.warnings.is_empty(), "second pass has nothing left to rewrite");
    }

    // -----------------------------------------------------------------------
    // Feature gating
    // -----------------------------------------------------------------------

    #[test]
    fn system_prompt_and_temperature_drop_silently_for_free_tier() {
        let mut request = simple_request(Some("mistralai/mistral-small"));
        request.system_prompt = Some("You are terse.".into());
        request.temperature = Some(0.2);

        let result = validate(request, &context(Tier::Free), &test_catalog()).unwrap();
        assert_eq!(result.request.system_prompt, None);
        assert_eq!(result.request.temperature, None);
    }

    #[test]
    fn pro_tier_keeps_system_prompt_and_temperature() {
        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.system_prompt = Some("You are terse.".into());
        request.temperature = Some(0.2);

        let result = validate(request, &context(Tier::Pro), &test_catalog()).unwrap();
        assert_eq!(result.request.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(result.request.temperature, Some(0.2));
    }

    #[test]
    fn web_search_errors_rather_than_dropping() {
        let mut request = simple_request(Some("mistralai/mistral-small"));
        request.web_search = true;
        let err = validate(request, &context(Tier::Free), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::FeatureNotAvailable);
    }

    #[test]
    fn reasoning_errors_for_non_enterprise() {
        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.reasoning = Some(ReasoningOptions { effort: ReasoningEffort::Low });
        let err = validate(request, &context(Tier::Pro), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::FeatureNotAvailable);

        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.reasoning = Some(ReasoningOptions { effort: ReasoningEffort::Low });
        assert!(validate(request, &context(Tier::Enterprise), &test_catalog()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Attachment gating
    // -----------------------------------------------------------------------

    #[test]
    fn attachments_require_the_feature_flag() {
        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.attachment_ids = Some(vec!["a1".into()]);
        let err = validate(request, &context(Tier::Free), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::FeatureNotAvailable);
    }

    #[test]
    fn attachments_require_an_image_capable_model() {
        let mut request = simple_request(Some("mistralai/mistral-small"));
        request.attachment_ids = Some(vec!["a1".into()]);
        let err = validate(request, &context(Tier::Pro), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AttachmentInvalid);
    }

    #[test]
    fn attachment_count_boundary_is_three() {
        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.attachment_ids = Some(vec!["a".into(), "b".into(), "c".into()]);
        assert!(validate(request, &context(Tier::Pro), &test_catalog()).is_ok());

        let mut request = simple_request(Some("anthropic/claude-sonnet"));
        request.attachment_ids = Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        let err = validate(request, &context(Tier::Pro), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AttachmentLimit);
    }

    // -----------------------------------------------------------------------
    // Token budget
    // -----------------------------------------------------------------------

    fn request_with_chars(model: &str, chars: usize) -> ChatRequest {
        serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "x".repeat(chars) }],
            "model": model,
        }))
        .unwrap()
    }

    #[test]
    fn budget_boundary_is_inclusive() {
        // Anonymous budget: 5 000 tokens = 20 000 chars exactly.
        let at_limit = request_with_chars("mistralai/mistral-small", 5_000 * 4);
        let result = validate(at_limit, &context(Tier::Anonymous), &test_catalog()).unwrap();
        assert_eq!(result.estimated_input_tokens, 5_000);

        let over = request_with_chars("mistralai/mistral-small", 5_000 * 4 + 1);
        let err = validate(over, &context(Tier::Anonymous), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenLimitExceeded);
    }

    #[test]
    fn model_context_window_caps_the_budget_below_the_tier_limit() {
        // Enterprise allows 50k tokens, but gemma's window is 8 192.
        let request = request_with_chars("google/gemma-2-9b-it:free", 10_000 * 4);
        let err = validate(request, &context(Tier::Enterprise), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenLimitExceeded);
    }

    #[test]
    fn empty_messages_are_rejected() {
        let request: ChatRequest =
            serde_json::from_value(json!({ "messages": [] })).unwrap();
        let err = validate(request, &context(Tier::Free), &test_catalog()).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn message_helpers_cover_plain_and_block_content() {
        let message = ChatMessage {
            role: Role::User,
            content: MessageContent::Text("plain".into()),
        };
        assert_eq!(message.content.image_count(), 0);
    }
}
