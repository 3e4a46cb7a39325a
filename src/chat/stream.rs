//! Stream transformer — Router SSE in, the client wire protocol out.
//!
//! The transformer is an explicit state machine (`Streaming → Closed`, with
//! the flush composing the terminal envelope on the transition) driven by
//! one consumer task: the HTTP response body polls it,
//! it polls the upstream SSE line stream, and every output byte is produced
//! in arrival order. There are no callbacks and no detached tasks — dropping
//! the body (client disconnect) drops the transformer, which drops the
//! upstream response and cancels the Router read.
//!
//! Wire contract, in order:
//! - content bytes, forwarded verbatim as they arrive;
//! - optional single-line progressive markers (`__REASONING_CHUNK__…`,
//!   `__ANNOTATIONS_CHUNK__…`), each newline-terminated;
//! - exactly one terminal envelope bracketed by `__STREAM_METADATA_START__`
//!   / `__STREAM_METADATA_END__`, the last bytes on the stream.
//!
//! A client that strips marker lines and the envelope reconstructs the exact
//! assistant text. Reasoning deltas never touch the content accumulator.

use std::{
    collections::VecDeque,
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::{
    chat::{Annotation, ChatResponse, Usage},
    upstream::ByteStream,
    usage::UsageOutcome,
};

pub const REASONING_MARKER: &str = "__REASONING_CHUNK__";
pub const ANNOTATIONS_MARKER: &str = "__ANNOTATIONS_CHUNK__";
pub const METADATA_START: &str = "__STREAM_METADATA_START__";
pub const METADATA_END: &str = "__STREAM_METADATA_END__";

/// Upstream SSE lines longer than this abort the stream. Router records are
/// far smaller; the bound keeps a misbehaving upstream from growing the
/// line buffer without limit.
const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Per-request parameters, resolved by the handler before the stream opens.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub model: String,
    /// The triggering user message id, echoed in the terminal envelope.
    pub request_id: String,
    /// Forward progressive marker lines at all.
    pub markers_enabled: bool,
    /// Forward reasoning deltas (markers on, runtime reasoning flag on, tier
    /// permits, caller asked). Reasoning is accumulated for the envelope
    /// regardless.
    pub forward_reasoning: bool,
    pub debug_enabled: bool,
    /// Hard deadline for the whole stream.
    pub deadline: Duration,
    /// Validation warnings, echoed in the terminal envelope.
    pub warnings: Vec<String>,
}

/// What the stream amounted to, delivered once over a oneshot for usage
/// recording. Dropping the transformer mid-stream reports `Cancelled`.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub outcome: UsageOutcome,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

enum Phase {
    Streaming,
    Closed,
}

type SseLines = Pin<Box<dyn Stream<Item = Result<String, LinesCodecError>> + Send>>;

pub struct StreamTransformer {
    lines: SseLines,
    phase: Phase,
    /// Bytes composed but not yet polled out.
    queue: VecDeque<Bytes>,
    params: StreamParams,
    started: Instant,
    content: String,
    reasoning: String,
    annotations: Vec<Annotation>,
    usage: Usage,
    upstream_id: String,
    first_annotation_at: Option<Instant>,
    /// Wakes the task at the deadline even when the upstream has stalled.
    deadline_timer: Pin<Box<tokio::time::Sleep>>,
    summary: Option<oneshot::Sender<StreamSummary>>,
}

impl StreamTransformer {
    pub fn new(
        upstream: ByteStream,
        params: StreamParams,
        summary: oneshot::Sender<StreamSummary>,
    ) -> Self {
        let reader = StreamReader::new(upstream.map(|r| r.map_err(std::io::Error::other)));
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES));
        let deadline_timer = Box::pin(tokio::time::sleep(params.deadline));
        Self {
            lines: Box::pin(lines),
            phase: Phase::Streaming,
            queue: VecDeque::new(),
            params,
            started: Instant::now(),
            content: String::new(),
            reasoning: String::new(),
            annotations: Vec::new(),
            usage: Usage::default(),
            upstream_id: String::new(),
            first_annotation_at: None,
            deadline_timer,
            summary: Some(summary),
        }
    }

    /// Parse one upstream SSE line and queue whatever it produces.
    fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix("data:") else {
            // SSE comments, `event:` lines, blank keep-alives.
            return;
        };
        let payload = payload.trim_start();

        if payload == "[DONE]" {
            self.flush();
            return;
        }

        let record: Value = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream record");
                return;
            }
        };

        // An error record without choices ends the stream inline.
        if record.get("error").is_some() && record.get("choices").is_none() {
            let detail = record
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error");
            warn!(detail, "upstream emitted an error record");
            self.fail("The upstream provider failed while streaming.");
            return;
        }

        if let Some(id) = record.get("id").and_then(Value::as_str) {
            self.upstream_id = id.to_string();
        }
        if let Some(usage) = record.get("usage") {
            if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
                self.usage = parsed;
            }
        }

        let Some(delta) = record.pointer("/choices/0/delta") else {
            return;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                if self.params.debug_enabled {
                    debug!(bytes = content.len(), "content delta");
                }
                self.content.push_str(content);
                self.queue.push_back(Bytes::from(content.to_string()));
            }
        }

        if let Some(reasoning) = delta.get("reasoning").and_then(Value::as_str) {
            if !reasoning.is_empty() {
                self.reasoning.push_str(reasoning);
                if self.params.forward_reasoning {
                    let marker = format!("{REASONING_MARKER}{}\n", json!({ "t": reasoning }));
                    self.queue.push_back(Bytes::from(marker));
                }
            }
        }

        if let Some(annotations) = delta.get("annotations").and_then(Value::as_array) {
            let before = self.annotations.len();
            for value in annotations {
                if let Some(annotation) = Annotation::from_upstream(value) {
                    if !self.annotations.iter().any(|a| a.url == annotation.url) {
                        self.annotations.push(annotation);
                    }
                }
            }
            if self.annotations.len() > before {
                if self.first_annotation_at.is_none() {
                    self.first_annotation_at = Some(Instant::now());
                    if self.params.debug_enabled {
                        debug!(
                            elapsed_ms = self.started.elapsed().as_millis() as u64,
                            "first annotation"
                        );
                    }
                }
                if self.params.markers_enabled {
                    let set = serde_json::to_string(&self.annotations)
                        .unwrap_or_else(|_| "[]".to_string());
                    self.queue.push_back(Bytes::from(format!("{ANNOTATIONS_MARKER}{set}\n")));
                }
            }
        }
    }

    /// Upstream ended normally: compose and queue the terminal envelope.
    fn flush(&mut self) {
        if !matches!(self.phase, Phase::Streaming) {
            return;
        }
        let payload = self.envelope_payload(None);
        self.queue.push_back(terminal_bytes(&payload));
        self.phase = Phase::Closed;
        self.finish(UsageOutcome::Ok);
    }

    /// Mid-stream failure: deliver the error inline via the terminal
    /// envelope (the HTTP status is long gone) and close.
    fn fail(&mut self, message: &str) {
        if !matches!(self.phase, Phase::Streaming) {
            return;
        }
        let payload = self.envelope_payload(Some(message));
        self.queue.push_back(terminal_bytes(&payload));
        self.phase = Phase::Closed;
        self.finish(UsageOutcome::UpstreamError);
    }

    fn envelope_payload(&self, error: Option<&str>) -> Value {
        let response = ChatResponse {
            response: self.content.clone(),
            usage: self.usage,
            request_id: self.params.request_id.clone(),
            timestamp: chrono::Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            content_type: ChatResponse::CONTENT_TYPE_MARKDOWN,
            id: self.upstream_id.clone(),
            model: Some(self.params.model.clone()),
            reasoning: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            annotations: self.annotations.clone(),
            has_websearch: !self.annotations.is_empty(),
            websearch_result_count: self.annotations.len(),
            warnings: self.params.warnings.clone(),
        };
        let mut payload = json!({ "__FINAL_METADATA__": response });
        if let Some(message) = error {
            payload["__FINAL_METADATA__"]["error"] = json!(message);
            payload["__FINAL_METADATA__"]["code"] = json!("UPSTREAM_ERROR");
        }
        payload
    }

    fn finish(&mut self, outcome: UsageOutcome) {
        if let Some(sender) = self.summary.take() {
            let _ = sender.send(StreamSummary {
                outcome,
                usage: self.usage,
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
    }
}

fn terminal_bytes(payload: &Value) -> Bytes {
    Bytes::from(format!("\n\n{METADATA_START}\n{payload}\n{METADATA_END}\n"))
}

impl Stream for StreamTransformer {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(bytes) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(bytes)));
            }
            if matches!(this.phase, Phase::Closed) {
                return Poll::Ready(None);
            }
            if this.deadline_timer.as_mut().poll(cx).is_ready() {
                warn!(model = %this.params.model, "stream deadline exceeded");
                this.fail("The stream exceeded its deadline.");
                continue;
            }

            match ready!(this.lines.as_mut().poll_next(cx)) {
                Some(Ok(line)) => this.handle_line(&line),
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream read failed");
                    this.fail("The upstream provider failed while streaming.");
                }
                None => this.flush(),
            }
        }
    }
}

impl Drop for StreamTransformer {
    fn drop(&mut self) {
        // Client went away before the envelope: record a cancellation.
        self.finish(UsageOutcome::Cancelled);
    }
}
