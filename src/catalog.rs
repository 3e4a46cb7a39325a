//! Model catalog — the single source of truth for which models exist, what
//! they accept and produce, and their token limits.
//!
//! Descriptors come from Router's `GET /models` and are cached in-process as
//! an immutable snapshot behind an `RwLock<Arc<_>>`: readers clone the `Arc`
//! (nanoseconds under the lock) and keep one consistent view for the length
//! of a request. Refreshes are single-flight — one fetch per expiry, with
//! concurrent callers sharing the result. A failed refresh keeps serving the
//! stale snapshot rather than failing requests.

use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Content modality a model can consume or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Image,
}

/// One model as advertised by Router.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub input_modalities: Vec<Modality>,
    pub output_modalities: Vec<Modality>,
    /// Context window in tokens.
    pub context_window: u64,
    /// Published output cap; absent for models where Router does not report
    /// one (see [`CatalogSnapshot::token_limits`] for the fallback policy).
    pub max_output_tokens: Option<u64>,
    /// USD per 1 000 input tokens.
    pub price_per_k_input: f64,
    /// USD per 1 000 output tokens.
    pub price_per_k_output: f64,
    pub supports_reasoning: bool,
    pub free_variant: bool,
    pub deprecated: bool,
}

impl ModelDescriptor {
    pub fn accepts_images(&self) -> bool {
        self.input_modalities.contains(&Modality::Image)
    }
}

/// Input/output budget for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
}

/// Capability classification consumed by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelClass {
    pub multimodal_input: bool,
    pub multimodal_output: bool,
    pub reasoning_capable: bool,
    pub free: bool,
}

/// Output-cap policy when Router publishes none: a quarter of the context
/// window, capped at 8 192 tokens.
const FALLBACK_OUTPUT_CAP: u64 = 8_192;

/// An immutable view of the catalog at one point in time.
pub struct CatalogSnapshot {
    models: Vec<ModelDescriptor>,
    fetched_at: Option<Instant>,
}

impl CatalogSnapshot {
    fn empty() -> Self {
        Self { models: Vec::new(), fetched_at: None }
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Active (non-deprecated) model ids in Router's order.
    pub fn model_ids(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| !m.deprecated)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// Token budget for a model. `None` when the model is unknown.
    pub fn token_limits(&self, model_id: &str) -> Option<TokenLimits> {
        let model = self.get(model_id)?;
        let max_output = model
            .max_output_tokens
            .unwrap_or_else(|| (model.context_window / 4).min(FALLBACK_OUTPUT_CAP));
        Some(TokenLimits {
            max_input_tokens: model.context_window,
            max_output_tokens: max_output,
        })
    }

    pub fn classify(&self, model_id: &str) -> Option<ModelClass> {
        let model = self.get(model_id)?;
        Some(ModelClass {
            multimodal_input: model.input_modalities.contains(&Modality::Image),
            multimodal_output: model.output_modalities.contains(&Modality::Image),
            reasoning_capable: model.supports_reasoning,
            free: model.free_variant,
        })
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

#[cfg(test)]
impl CatalogSnapshot {
    pub(crate) fn for_tests(models: Vec<ModelDescriptor>) -> Self {
        Self { models, fetched_at: Some(Instant::now()) }
    }
}

/// Process-wide catalog cache.
pub struct ModelCatalog {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    /// Serializes refreshes so concurrent misses produce one upstream fetch.
    refresh: tokio::sync::Mutex<()>,
}

impl ModelCatalog {
    pub fn new(base_url: String, api_key: Option<&str>, ttl_secs: u64) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build catalog http client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl: Duration::from_secs(ttl_secs),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Current catalog view, refreshing first if the TTL has lapsed.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        let current = self.current();
        if current.is_fresh(self.ttl) {
            return current;
        }

        let _guard = self.refresh.lock().await;
        // Someone else may have refreshed while we queued for the lock.
        let current = self.current();
        if current.is_fresh(self.ttl) {
            return current;
        }

        match self.fetch().await {
            Ok(models) => {
                debug!(count = models.len(), "model catalog refreshed");
                let fresh = Arc::new(CatalogSnapshot {
                    models,
                    fetched_at: Some(Instant::now()),
                });
                *self.snapshot.write().expect("catalog lock poisoned") = Arc::clone(&fresh);
                fresh
            }
            Err(e) => {
                warn!(error = %e, degraded = true, "catalog refresh failed — serving previous snapshot");
                current
            }
        }
    }

    /// The snapshot as-is, no refresh. For paths that must not block on IO.
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().expect("catalog lock poisoned").clone()
    }

    async fn fetch(&self) -> anyhow::Result<Vec<ModelDescriptor>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "catalog endpoint returned HTTP {status}");

        let body: Value = response.json().await.context("parsing catalog response")?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .context("catalog response has no `data` array")?;

        Ok(data.iter().filter_map(parse_descriptor).collect())
    }
}

/// Parse one upstream model object. Records missing an id are skipped.
fn parse_descriptor(value: &Value) -> Option<ModelDescriptor> {
    let id = value.get("id")?.as_str()?.to_string();
    let display_name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    let modalities = |key: &str| -> Vec<Modality> {
        let listed: Vec<Modality> = value
            .pointer(&format!("/architecture/{key}"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| match s {
                        "text" => Some(Modality::Text),
                        "image" => Some(Modality::Image),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if listed.is_empty() {
            vec![Modality::Text]
        } else {
            listed
        }
    };

    let context_window = value
        .get("context_length")
        .and_then(Value::as_u64)
        .unwrap_or(4_096);
    let max_output_tokens = value
        .pointer("/top_provider/max_completion_tokens")
        .and_then(Value::as_u64);

    // Router prices are USD per token, as strings.
    let price_per_k = |key: &str| -> f64 {
        value
            .pointer(&format!("/pricing/{key}"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
            * 1_000.0
    };
    let price_per_k_input = price_per_k("prompt");
    let price_per_k_output = price_per_k("completion");

    let supports_reasoning = value
        .get("supported_parameters")
        .and_then(Value::as_array)
        .is_some_and(|a| a.iter().any(|p| p.as_str() == Some("reasoning")));
    let free_variant =
        id.ends_with(":free") || (price_per_k_input == 0.0 && price_per_k_output == 0.0);
    let deprecated = value
        .get("deprecated")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Some(ModelDescriptor {
        id,
        display_name,
        input_modalities: modalities("input_modalities"),
        output_modalities: modalities("output_modalities"),
        context_window,
        max_output_tokens,
        price_per_k_input,
        price_per_k_output,
        supports_reasoning,
        free_variant,
        deprecated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_body() -> Value {
        json!({
            "data": [
                {
                    "id": "anthropic/claude-sonnet",
                    "name": "Claude Sonnet",
                    "architecture": {
                        "input_modalities": ["text", "image"],
                        "output_modalities": ["text"],
                    },
                    "context_length": 200_000,
                    "top_provider": { "max_completion_tokens": 16_384 },
                    "pricing": { "prompt": "0.000003", "completion": "0.000015" },
                    "supported_parameters": ["temperature", "reasoning"],
                },
                {
                    "id": "google/gemma-2-9b-it:free",
                    "name": "Gemma 2 9B (free)",
                    "architecture": {
                        "input_modalities": ["text"],
                        "output_modalities": ["text"],
                    },
                    "context_length": 8_192,
                    "pricing": { "prompt": "0", "completion": "0" },
                },
            ]
        })
    }

    async fn mock_catalog(server: &MockServer, ttl_secs: u64) -> ModelCatalog {
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body()))
            .mount(server)
            .await;
        ModelCatalog::new(server.uri(), None, ttl_secs)
    }

    #[tokio::test]
    async fn fetches_and_parses_descriptors() {
        let server = MockServer::start().await;
        let catalog = mock_catalog(&server, 300).await;

        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.models().len(), 2);

        let sonnet = snapshot.get("anthropic/claude-sonnet").unwrap();
        assert!(sonnet.accepts_images());
        assert_eq!(sonnet.context_window, 200_000);
        assert_eq!(sonnet.max_output_tokens, Some(16_384));
        assert!((sonnet.price_per_k_input - 0.003).abs() < 1e-9);
        assert!(sonnet.supports_reasoning);
        assert!(!sonnet.free_variant);

        let gemma = snapshot.get("google/gemma-2-9b-it:free").unwrap();
        assert!(gemma.free_variant);
        assert!(!gemma.accepts_images());
    }

    #[tokio::test]
    async fn snapshot_is_cached_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body()))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = ModelCatalog::new(server.uri(), None, 300);
        catalog.snapshot().await;
        catalog.snapshot().await;
        catalog.snapshot().await;
        // wiremock verifies the expect(1) on drop.
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(catalog_body())
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let catalog = Arc::new(ModelCatalog::new(server.uri(), None, 300));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                tokio::spawn(async move { catalog.snapshot().await.models().len() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_serving_the_stale_snapshot() {
        let server = MockServer::start().await;
        let catalog = ModelCatalog::new(server.uri(), None, 0).await_warmup(&server).await;

        // Replace the mock with a 500; ttl of 0 forces a refresh attempt.
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.models().len(), 2, "stale snapshot must survive refresh failures");
    }

    // Helper: warm a catalog once against the standard body.
    impl ModelCatalog {
        async fn await_warmup(self, server: &MockServer) -> Self {
            Mock::given(method("GET"))
                .and(path("/models"))
                .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body()))
                .mount(server)
                .await;
            self.snapshot().await;
            self
        }
    }

    #[test]
    fn token_limits_fall_back_to_quarter_context_capped() {
        let snapshot = CatalogSnapshot {
            models: vec![
                ModelDescriptor {
                    id: "published".into(),
                    display_name: "p".into(),
                    input_modalities: vec![Modality::Text],
                    output_modalities: vec![Modality::Text],
                    context_window: 100_000,
                    max_output_tokens: Some(4_000),
                    price_per_k_input: 0.0,
                    price_per_k_output: 0.0,
                    supports_reasoning: false,
                    free_variant: true,
                    deprecated: false,
                },
                ModelDescriptor {
                    id: "small".into(),
                    display_name: "s".into(),
                    input_modalities: vec![Modality::Text],
                    output_modalities: vec![Modality::Text],
                    context_window: 8_192,
                    max_output_tokens: None,
                    price_per_k_input: 0.0,
                    price_per_k_output: 0.0,
                    supports_reasoning: false,
                    free_variant: true,
                    deprecated: false,
                },
                ModelDescriptor {
                    id: "large".into(),
                    display_name: "l".into(),
                    input_modalities: vec![Modality::Text],
                    output_modalities: vec![Modality::Text],
                    context_window: 200_000,
                    max_output_tokens: None,
                    price_per_k_input: 0.0,
                    price_per_k_output: 0.0,
                    supports_reasoning: false,
                    free_variant: true,
                    deprecated: false,
                },
            ],
            fetched_at: Some(Instant::now()),
        };

        // Published cap wins.
        assert_eq!(snapshot.token_limits("published").unwrap().max_output_tokens, 4_000);
        // Quarter of a small context window.
        assert_eq!(snapshot.token_limits("small").unwrap().max_output_tokens, 2_048);
        // Quarter would exceed the cap — clamped.
        assert_eq!(snapshot.token_limits("large").unwrap().max_output_tokens, 8_192);
        // Input budget is the context window.
        assert_eq!(snapshot.token_limits("large").unwrap().max_input_tokens, 200_000);
        // Unknown model has no limits.
        assert!(snapshot.token_limits("missing").is_none());
    }

    #[test]
    fn classify_reports_capabilities() {
        let model = ModelDescriptor {
            id: "m".into(),
            display_name: "m".into(),
            input_modalities: vec![Modality::Text, Modality::Image],
            output_modalities: vec![Modality::Text],
            context_window: 8_192,
            max_output_tokens: None,
            price_per_k_input: 0.001,
            price_per_k_output: 0.002,
            supports_reasoning: true,
            free_variant: false,
            deprecated: false,
        };
        let snapshot = CatalogSnapshot { models: vec![model], fetched_at: Some(Instant::now()) };

        let class = snapshot.classify("m").unwrap();
        assert!(class.multimodal_input);
        assert!(!class.multimodal_output);
        assert!(class.reasoning_capable);
        assert!(!class.free);
    }

    #[test]
    fn deprecated_models_are_excluded_from_active_ids() {
        let mut dead = parse_descriptor(&json!({ "id": "old/model" })).unwrap();
        dead.deprecated = true;
        let live = parse_descriptor(&json!({ "id": "new/model" })).unwrap();
        let snapshot = CatalogSnapshot {
            models: vec![dead, live],
            fetched_at: Some(Instant::now()),
        };
        assert_eq!(snapshot.model_ids(), vec!["new/model".to_string()]);
    }

    #[test]
    fn parse_descriptor_defaults_for_sparse_records() {
        let model = parse_descriptor(&json!({ "id": "bare/model" })).unwrap();
        assert_eq!(model.display_name, "bare/model");
        assert_eq!(model.input_modalities, vec![Modality::Text]);
        assert_eq!(model.context_window, 4_096);
        assert!(model.free_variant, "zero pricing reads as free");
        assert!(parse_descriptor(&json!({ "name": "no id" })).is_none());
    }
}
