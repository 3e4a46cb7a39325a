//! Usage recording — one structured event per chat outcome.
//!
//! Every chat request, buffered or streamed, ends in exactly one
//! [`UsageEvent`]: who (user id or IP hash), what (model, tokens, cost),
//! how it went (outcome), and how long it took. Events are emitted as
//! structured tracing records for the billing pipeline and additionally kept
//! in a fixed-capacity in-memory ring buffer surfaced through the internal
//! API. Recording is strictly best-effort; it can never fail a request.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{auth::Tier, chat::Usage};

/// How a chat request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Ok,
    Rejected,
    UpstreamError,
    Cancelled,
}

impl UsageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Rejected => "rejected",
            Self::UpstreamError => "upstream_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single billable (or billable-adjacent) event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageEvent {
    /// `user:{id}` or `ip:{hash}`.
    pub subject: String,
    pub tier: Tier,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in 1/1000-cent units (10⁻⁵ USD).
    pub cost_milli_cents: u64,
    pub elapsed_ms: u64,
    pub outcome: UsageOutcome,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Convert token counts and catalog prices (USD per 1 000 tokens) into
/// 1/1000-cent units, rounded to nearest.
pub fn cost_milli_cents(usage: &Usage, price_per_k_input: f64, price_per_k_output: f64) -> u64 {
    let dollars = usage.prompt_tokens as f64 / 1_000.0 * price_per_k_input
        + usage.completion_tokens as f64 / 1_000.0 * price_per_k_output;
    (dollars * 100_000.0).round() as u64
}

/// Fixed-capacity ring buffer of recent [`UsageEvent`] records.
///
/// Safe to share via `Arc<UsageLog>`. [`record`][Self::record] uses a
/// non-blocking `try_lock` so it never delays the request path; under lock
/// contention the in-memory copy is dropped (the tracing event survives).
pub struct UsageLog {
    capacity: usize,
    entries: Mutex<VecDeque<UsageEvent>>,
}

impl UsageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Emit the structured event and buffer it.
    pub fn record(&self, event: UsageEvent) {
        tracing::info!(
            target: "usage",
            subject = %event.subject,
            tier = %event.tier,
            model = %event.model_id,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            cost_milli_cents = event.cost_milli_cents,
            elapsed_ms = event.elapsed_ms,
            outcome = event.outcome.as_str(),
            request_id = %event.request_id,
            "chat usage"
        );

        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(event);
        }
    }

    /// Up to `limit` recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<UsageEvent> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregates over all buffered events.
    pub async fn stats(&self) -> UsageStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_elapsed_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.elapsed_ms as f64).sum::<f64>() / total as f64
        };

        let mut model_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for event in entries.iter() {
            *model_counts.entry(event.model_id.clone()).or_default() += 1;
        }

        UsageStats {
            total_requests: total,
            ok_count: entries.iter().filter(|e| e.outcome == UsageOutcome::Ok).count(),
            rejected_count: entries
                .iter()
                .filter(|e| e.outcome == UsageOutcome::Rejected)
                .count(),
            error_count: entries
                .iter()
                .filter(|e| e.outcome == UsageOutcome::UpstreamError)
                .count(),
            cancelled_count: entries
                .iter()
                .filter(|e| e.outcome == UsageOutcome::Cancelled)
                .count(),
            total_input_tokens: entries.iter().map(|e| e.input_tokens).sum(),
            total_output_tokens: entries.iter().map(|e| e.output_tokens).sum(),
            total_cost_milli_cents: entries.iter().map(|e| e.cost_milli_cents).sum(),
            avg_elapsed_ms,
            model_counts,
        }
    }
}

/// Aggregate statistics derived from all buffered [`UsageEvent`] records.
#[derive(Debug, Serialize)]
pub struct UsageStats {
    pub total_requests: usize,
    pub ok_count: usize,
    pub rejected_count: usize,
    pub error_count: usize,
    pub cancelled_count: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_milli_cents: u64,
    pub avg_elapsed_ms: f64,
    pub model_counts: std::collections::HashMap<String, usize>,
}
