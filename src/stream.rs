//! Stream Interceptor
//!
//! Mediates one streaming response between upstream and client: parses each
//! SSE frame, accumulates authoritative usage and the assistant text, runs
//! the security response analyzer on the buffered text every N chunks or K
//! bytes, and terminates mid-flight when a kill is decided. On any exit the
//! final usage is billed and journalled.
//!
//! State machine: Active -> Terminated | Completed. Paused is reserved for
//! budget mid-stream pauses and has no transition on this path. Termination
//! wins races with forwarding: a kill that lands between two chunks drops
//! every subsequent chunk.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::response::{sse::Event as SseEvent, sse::KeepAlive, IntoResponse, Response, Sse};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::Principal;
use crate::cost::calculate_cost;
use crate::journal::JournalRecord;
use crate::security::types::ScanContext;
use crate::tokens::{self, Usage};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    /// Reserved for budget-driven mid-stream pauses
    #[allow(dead_code)]
    Paused,
    Terminated,
    Completed,
}

/// Terminated sessions park their conversation here so the caller can
/// re-issue against a different model. One fetch, then gone.
#[derive(Default)]
pub struct StreamContexts {
    contexts: DashMap<Uuid, Vec<Value>>,
}

impl StreamContexts {
    pub fn preserve(&self, request_id: Uuid, mut messages: Vec<Value>, accumulated: &str) {
        if !accumulated.is_empty() {
            messages.push(json!({ "role": "assistant", "content": accumulated }));
        }
        self.contexts.insert(request_id, messages);
    }

    /// Original messages plus the partial assistant turn. Removes the entry.
    pub fn take_continuation(&self, request_id: Uuid) -> Option<Vec<Value>> {
        self.contexts.remove(&request_id).map(|(_, v)| v)
    }
}

/// What one SSE line means for the pump loop.
#[derive(Debug, PartialEq)]
enum LineAction {
    Forward { event: Option<String>, data: String },
    Done,
    Ignore,
    /// A line that is not SSE framing at all (unary body served on a
    /// stream request)
    NonSse(String),
}

/// Per-session parse state: usage counters, buffered assistant text, and the
/// pending SSE event name (Anthropic frames are `event:` + `data:` pairs).
struct StreamAccumulator {
    usage: Usage,
    accumulated: String,
    pending_event: Option<String>,
}

impl StreamAccumulator {
    fn new() -> Self {
        Self {
            usage: Usage::default(),
            accumulated: String::new(),
            pending_event: None,
        }
    }

    fn ingest_line(&mut self, provider: &str, line: &str) -> LineAction {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return LineAction::Ignore;
        }

        if let Some(name) = line.strip_prefix("event: ") {
            self.pending_event = Some(name.to_string());
            return LineAction::Ignore;
        }

        let Some(data) = line.strip_prefix("data: ") else {
            if line.starts_with(':') {
                return LineAction::Ignore;
            }
            return LineAction::NonSse(line.to_string());
        };

        if data == "[DONE]" {
            return LineAction::Done;
        }

        if let Ok(value) = serde_json::from_str::<Value>(data) {
            tokens::apply_stream_event(provider, &value, &mut self.usage);
            if let Some(delta) = tokens::extract_text_delta(provider, &value) {
                self.accumulated.push_str(delta);
            }
        }

        LineAction::Forward {
            event: self.pending_event.take(),
            data: data.to_string(),
        }
    }
}

pub struct StreamParams {
    pub provider: String,
    pub request_id: Uuid,
    pub principal: Principal,
    pub model_original: String,
    pub model_effective: String,
    pub endpoint: String,
    /// Original request messages, kept only for context preservation
    pub messages: Vec<Value>,
    pub started: Instant,
}

/// Wrap an upstream streaming response into a client SSE response with
/// security interception and post-completion billing.
pub async fn create_streaming_response(
    state: Arc<AppState>,
    upstream: reqwest::Response,
    params: StreamParams,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(100);
    let (kill_tx, mut kill_rx) = mpsc::channel::<crate::security::KillSignal>(4);
    state.security.register_session(params.request_id, kill_tx);

    let request_id = params.request_id;
    let model_effective = params.model_effective.clone();
    let check_chunks = state.config.stream_check_chunks.max(1);
    let check_bytes = state.config.stream_check_bytes.max(1);

    tokio::spawn(async move {
        let ctx = ScanContext {
            user_id: params.principal.user_id,
            agent_id: params.principal.agent_id.map(|a| a.to_string()),
            request_id: params.request_id,
        };

        let mut acc = StreamAccumulator::new();
        let mut buffer = String::new();
        let mut stream_state = StreamState::Active;
        let mut chunk_count: u64 = 0;
        let mut bytes_since_check: usize = 0;
        let mut saw_sse_frame = false;
        let mut non_sse = String::new();
        let bytes_stream = upstream.bytes_stream();
        tokio::pin!(bytes_stream);

        'pump: loop {
            tokio::select! {
                // Termination wins races with forwarding.
                biased;

                Some(signal) = kill_rx.recv() => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        reason = %signal.reason,
                        "stream terminated by security"
                    );
                    stream_state = StreamState::Terminated;
                    break 'pump;
                }

                chunk = bytes_stream.next() => {
                    let bytes = match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            tracing::error!(request_id = %ctx.request_id, error = %e, "upstream stream error");
                            stream_state = StreamState::Completed;
                            break 'pump;
                        }
                        None => {
                            stream_state = StreamState::Completed;
                            break 'pump;
                        }
                    };

                    chunk_count += 1;
                    bytes_since_check += bytes.len();
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(newline) = buffer.find('\n') {
                        let line: String = buffer.drain(..=newline).collect();
                        match acc.ingest_line(&params.provider, line.trim_end()) {
                            LineAction::Forward { event, data } => {
                                saw_sse_frame = true;
                                let mut sse = SseEvent::default().data(data);
                                if let Some(event) = event {
                                    sse = sse.event(event);
                                }
                                if tx.send(Ok(sse)).await.is_err() {
                                    // Client went away: stop the upstream
                                    // call, bill what was received.
                                    tracing::debug!(request_id = %ctx.request_id, "client disconnected mid-stream");
                                    stream_state = StreamState::Terminated;
                                    break 'pump;
                                }
                            }
                            LineAction::Done => {
                                saw_sse_frame = true;
                                let _ = tx.send(Ok(SseEvent::default().data("[DONE]"))).await;
                                stream_state = StreamState::Completed;
                                break 'pump;
                            }
                            LineAction::Ignore => {}
                            LineAction::NonSse(raw) => {
                                if !saw_sse_frame {
                                    non_sse.push_str(&raw);
                                    non_sse.push('\n');
                                }
                            }
                        }
                    }

                    if chunk_count % check_chunks == 0 || bytes_since_check >= check_bytes {
                        bytes_since_check = 0;
                        let summary = state.security.scan_buffered(&acc.accumulated, &ctx);
                        if state.security.should_kill_stream(&summary) {
                            state.security.kill_session(
                                &ctx,
                                format!("mid-stream detection: {:?}", summary.threat_type_names()),
                            );
                            stream_state = StreamState::Terminated;
                            break 'pump;
                        }
                    }
                }
            }
        }

        // Upstream may answer a stream request with one unary JSON body.
        // Relay it as a single event and pull its usage block.
        non_sse.push_str(&buffer);
        let non_sse = non_sse.replace('\r', "");
        let unary_body = non_sse.trim();
        if !saw_sse_frame && !unary_body.is_empty() {
            if let Ok(body) = serde_json::from_str::<Value>(unary_body) {
                acc.usage = tokens::extract_usage(&params.provider, &body);
            }
            let _ = tx.send(Ok(SseEvent::default().data(unary_body))).await;
        }

        state.security.unregister_session(ctx.request_id);
        drop(tx);

        if stream_state == StreamState::Terminated {
            state
                .stream_contexts
                .preserve(ctx.request_id, params.messages, &acc.accumulated);
        }

        // The trailing usage chunk is optional on OpenAI-shape streams;
        // fall back to a character estimate for the output side.
        let mut usage = acc.usage;
        if usage.output_tokens == 0 && !acc.accumulated.is_empty() {
            usage.output_tokens = tokens::estimate_output_from_chars(&acc.accumulated);
            tracing::debug!(
                request_id = %ctx.request_id,
                estimated = usage.output_tokens,
                "stream carried no usage block, output estimated from characters"
            );
        }

        let descriptor =
            state
                .pricing
                .lookup(&params.provider, &params.model_effective, Utc::now());
        let cost = calculate_cost(&usage, &descriptor);
        let agent = ctx.agent_id.clone();
        state.budget.debit(
            ctx.user_id,
            cost,
            agent.as_deref(),
            Some(&params.model_effective),
        );

        let latency_ms = params.started.elapsed().as_millis() as u64;
        state
            .journal
            .append(JournalRecord {
                request_id: ctx.request_id,
                user_id: ctx.user_id,
                agent_id: params.principal.agent_id,
                provider: params.provider.clone(),
                model_original: params.model_original.clone(),
                model_effective: params.model_effective.clone(),
                endpoint: params.endpoint.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_creation_tokens: usage.cache_creation_tokens,
                cache_read_tokens: usage.cache_read_tokens,
                cost_usd: cost,
                latency_ms,
                status_code: 200,
                streaming: true,
                timestamp: Utc::now(),
            })
            .await;

        tracing::debug!(
            request_id = %ctx.request_id,
            state = ?stream_state,
            chunks = chunk_count,
            output_tokens = usage.output_tokens,
            cost_usd = %cost,
            "stream session closed"
        );
    });

    let mut response = Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new())
        .into_response();
    let headers = response.headers_mut();
    if let Ok(value) = request_id.to_string().parse() {
        headers.insert("x-acc-request-id", value);
    }
    if let Ok(value) = model_effective.parse() {
        headers.insert("x-acc-model-used", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_frames_accumulate_usage_and_text() {
        let mut acc = StreamAccumulator::new();

        assert_eq!(
            acc.ingest_line("anthropic", "event: message_start"),
            LineAction::Ignore
        );
        let action = acc.ingest_line(
            "anthropic",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":250}}}"#,
        );
        assert!(matches!(
            action,
            LineAction::Forward { ref event, .. } if event.as_deref() == Some("message_start")
        ));

        acc.ingest_line("anthropic", "event: content_block_delta");
        acc.ingest_line(
            "anthropic",
            r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#,
        );
        acc.ingest_line("anthropic", "event: content_block_delta");
        acc.ingest_line(
            "anthropic",
            r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":" world"}}"#,
        );
        acc.ingest_line("anthropic", "event: message_delta");
        acc.ingest_line(
            "anthropic",
            r#"data: {"type":"message_delta","usage":{"output_tokens":7}}"#,
        );

        assert_eq!(acc.usage.input_tokens, 250);
        assert_eq!(acc.usage.output_tokens, 7);
        assert_eq!(acc.accumulated, "Hello world");
    }

    #[test]
    fn openai_done_marker_ends_the_stream() {
        let mut acc = StreamAccumulator::new();
        acc.ingest_line(
            "openai",
            r#"data: {"choices":[{"delta":{"content":"hi"}}],"usage":null}"#,
        );
        assert_eq!(acc.ingest_line("openai", "data: [DONE]"), LineAction::Done);
        assert_eq!(acc.accumulated, "hi");
    }

    #[test]
    fn openai_trailing_usage_chunk_is_authoritative() {
        let mut acc = StreamAccumulator::new();
        acc.ingest_line(
            "openai",
            r#"data: {"choices":[{"delta":{"content":"abcd"}}],"usage":null}"#,
        );
        acc.ingest_line(
            "openai",
            r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
        );
        assert_eq!(acc.usage.input_tokens, 12);
        assert_eq!(acc.usage.output_tokens, 3);
    }

    #[test]
    fn malformed_json_is_forwarded_untouched() {
        let mut acc = StreamAccumulator::new();
        let action = acc.ingest_line("openai", "data: {not json");
        assert_eq!(
            action,
            LineAction::Forward {
                event: None,
                data: "{not json".to_string()
            }
        );
        assert_eq!(acc.usage, Usage::default());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(acc.ingest_line("openai", ""), LineAction::Ignore);
        assert_eq!(acc.ingest_line("openai", ": keep-alive"), LineAction::Ignore);
    }

    #[test]
    fn context_preservation_appends_partial_assistant_turn() {
        let contexts = StreamContexts::default();
        let request_id = Uuid::new_v4();
        let messages = vec![json!({ "role": "user", "content": "hello" })];
        contexts.preserve(request_id, messages, "partial answ");

        let continuation = contexts.take_continuation(request_id).unwrap();
        assert_eq!(continuation.len(), 2);
        assert_eq!(continuation[1]["role"], "assistant");
        assert_eq!(continuation[1]["content"], "partial answ");
        // One fetch only.
        assert!(contexts.take_continuation(request_id).is_none());
    }
}
