//! Token Meter
//!
//! Two jobs, never confused with each other:
//!
//! 1. Pre-flight estimates for budget checks and routing. OpenAI-shape
//!    requests go through the cl100k_base tokenizer; Anthropic and Gemini
//!    shapes use byte-ratio approximations. Estimates are never billed.
//! 2. Authoritative usage extraction from upstream responses, unary and
//!    streamed, via the provider-specific field names.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::CoreBPE;

use crate::providers::WireShape;

static CL100K: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is embedded"));

/// Authoritative token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// =============================================================================
// Pre-flight estimation
// =============================================================================

/// Estimate input tokens for a request body of the given wire shape.
pub fn estimate_request_tokens(shape: WireShape, body: &Value) -> u64 {
    match shape {
        WireShape::OpenAi => estimate_openai(body),
        WireShape::Anthropic => estimate_anthropic(body),
    }
}

/// OpenAI chat format: cl100k_base over message contents plus the per-message
/// framing overhead (3 per message, 1 per name, 3 priming the reply).
fn estimate_openai(body: &Value) -> u64 {
    let mut total: u64 = 3;

    for message in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        total += 3;
        if let Some(obj) = message.as_object() {
            for (key, value) in obj {
                match value {
                    Value::String(s) => total += CL100K.encode_ordinary(s).len() as u64,
                    Value::Array(parts) => {
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                total += CL100K.encode_ordinary(text).len() as u64;
                            }
                        }
                    }
                    _ => {}
                }
                if key.as_str() == "name" {
                    total += 1;
                }
            }
        }
    }

    total
}

/// Anthropic messages format: bytes/4 with a 1.1 correction factor, plus a
/// small per-message overhead. The real tokenizer is not public; accurate
/// counts come from the response usage.
fn estimate_anthropic(body: &Value) -> u64 {
    let mut bytes: u64 = 0;

    if let Some(system) = body.get("system") {
        bytes += text_bytes(system);
    }

    let mut message_count: u64 = 0;
    for message in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        message_count += 1;
        if let Some(content) = message.get("content") {
            bytes += text_bytes(content);
        }
    }

    let base = bytes / 4 + message_count * 4;
    base * 11 / 10
}

/// Gemini contents format: bytes/4 with a 1.05 correction factor.
pub fn estimate_google(contents: &Value, system_instruction: Option<&str>) -> u64 {
    let mut bytes: u64 = system_instruction.map_or(0, |s| s.len() as u64);

    for content in contents.as_array().into_iter().flatten() {
        for part in content.get("parts").and_then(Value::as_array).into_iter().flatten() {
            match part {
                Value::String(s) => bytes += s.len() as u64,
                other => {
                    if let Some(text) = other.get("text").and_then(Value::as_str) {
                        bytes += text.len() as u64;
                    }
                }
            }
        }
    }

    (bytes / 4) * 21 / 20
}

/// Rough chars/4 estimate over every text part of a body. Used by the router
/// for rule conditions; cheaper than tokenizing.
pub fn rough_total_tokens(body: &Value) -> u64 {
    let mut bytes: u64 = 0;
    if let Some(system) = body.get("system") {
        bytes += text_bytes(system);
    }
    for message in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        if let Some(content) = message.get("content") {
            bytes += text_bytes(content);
        }
    }
    bytes / 4
}

/// Byte length of the text carried by a content value (string, or an array of
/// `{type: "text", text}` blocks).
fn text_bytes(content: &Value) -> u64 {
    match content {
        Value::String(s) => s.len() as u64,
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(|t| t.len() as u64)
            .sum(),
        _ => 0,
    }
}

// =============================================================================
// Authoritative extraction (unary)
// =============================================================================

/// Extract usage from a complete upstream response body.
pub fn extract_usage(provider: &str, response: &Value) -> Usage {
    let mut usage = Usage::default();

    match provider {
        "anthropic" => {
            let u = &response["usage"];
            usage.input_tokens = u64_field(u, "input_tokens");
            usage.output_tokens = u64_field(u, "output_tokens");
            usage.cache_creation_tokens = u64_field(u, "cache_creation_input_tokens");
            usage.cache_read_tokens = u64_field(u, "cache_read_input_tokens");
        }
        "google" => {
            let m = &response["usageMetadata"];
            usage.input_tokens = u64_field(m, "promptTokenCount");
            usage.output_tokens = u64_field(m, "candidatesTokenCount");
            usage.cache_read_tokens = u64_field(m, "cachedContentTokenCount");
        }
        "deepseek" => {
            let u = &response["usage"];
            usage.input_tokens = u64_field(u, "prompt_tokens");
            usage.output_tokens = u64_field(u, "completion_tokens");
            usage.cache_read_tokens = u64_field(u, "prompt_cache_hit_tokens");
        }
        // openai, groq, mistral, xai: OpenAI-compatible usage block
        _ => {
            let u = &response["usage"];
            usage.input_tokens = u64_field(u, "prompt_tokens");
            usage.output_tokens = u64_field(u, "completion_tokens");
            usage.cache_read_tokens = u64_field(&u["prompt_tokens_details"], "cached_tokens");
        }
    }

    usage
}

// =============================================================================
// Streaming extraction
// =============================================================================

/// Fold one SSE event payload into the accumulated usage.
///
/// Anthropic: `message_start` carries input tokens, the final `message_delta`
/// carries the cumulative output count. OpenAI shape: a trailing chunk
/// carries the whole usage block when the client opted in via
/// `stream_options.include_usage`.
pub fn apply_stream_event(provider: &str, event: &Value, usage: &mut Usage) {
    match provider {
        "anthropic" => match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let u = &event["message"]["usage"];
                usage.input_tokens = u64_field(u, "input_tokens");
                usage.cache_creation_tokens = u64_field(u, "cache_creation_input_tokens");
                usage.cache_read_tokens = u64_field(u, "cache_read_input_tokens");
            }
            Some("message_delta") => {
                // Cumulative, not incremental: the last delta wins.
                let count = u64_field(&event["usage"], "output_tokens");
                if count > 0 {
                    usage.output_tokens = count;
                }
            }
            _ => {}
        },
        _ => {
            if let Some(u) = event.get("usage").filter(|u| !u.is_null()) {
                usage.input_tokens = u64_field(u, "prompt_tokens");
                usage.output_tokens = u64_field(u, "completion_tokens");
                usage.cache_read_tokens = u64_field(&u["prompt_tokens_details"], "cached_tokens");
            }
        }
    }
}

/// Pull the assistant text delta out of one SSE event, if it carries any.
pub fn extract_text_delta<'a>(provider: &str, event: &'a Value) -> Option<&'a str> {
    match provider {
        "anthropic" => {
            if event.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                event["delta"]["text"].as_str()
            } else {
                None
            }
        }
        _ => event["choices"][0]["delta"]["content"].as_str(),
    }
}

/// Estimate output tokens from accumulated text when the stream carried no
/// usage block (OpenAI without `stream_options.include_usage`).
pub fn estimate_output_from_chars(accumulated: &str) -> u64 {
    (accumulated.len() / 4) as u64
}

fn u64_field(value: &Value, field: &str) -> u64 {
    value.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_unary_usage_extraction() {
        let response = json!({
            "usage": {
                "input_tokens": 1000,
                "output_tokens": 500,
                "cache_creation_input_tokens": 20,
                "cache_read_input_tokens": 30,
            }
        });
        let usage = extract_usage("anthropic", &response);
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.output_tokens, 500);
        assert_eq!(usage.cache_creation_tokens, 20);
        assert_eq!(usage.cache_read_tokens, 30);
    }

    #[test]
    fn openai_unary_usage_extraction_with_cached_tokens() {
        let response = json!({
            "usage": {
                "prompt_tokens": 800,
                "completion_tokens": 200,
                "prompt_tokens_details": { "cached_tokens": 128 }
            }
        });
        let usage = extract_usage("openai", &response);
        assert_eq!(usage.input_tokens, 800);
        assert_eq!(usage.output_tokens, 200);
        assert_eq!(usage.cache_read_tokens, 128);
    }

    #[test]
    fn google_usage_metadata_extraction() {
        let response = json!({
            "usageMetadata": {
                "promptTokenCount": 42,
                "candidatesTokenCount": 17,
                "cachedContentTokenCount": 5
            }
        });
        let usage = extract_usage("google", &response);
        assert_eq!(usage.input_tokens, 42);
        assert_eq!(usage.output_tokens, 17);
        assert_eq!(usage.cache_read_tokens, 5);
    }

    #[test]
    fn missing_usage_block_yields_zeroes() {
        let usage = extract_usage("openai", &json!({"id": "cmpl"}));
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn anthropic_stream_events_accumulate() {
        let mut usage = Usage::default();
        apply_stream_event(
            "anthropic",
            &json!({
                "type": "message_start",
                "message": { "usage": { "input_tokens": 250 } }
            }),
            &mut usage,
        );
        apply_stream_event(
            "anthropic",
            &json!({ "type": "message_delta", "usage": { "output_tokens": 12 } }),
            &mut usage,
        );
        // Final message_delta carries the cumulative count.
        apply_stream_event(
            "anthropic",
            &json!({ "type": "message_delta", "usage": { "output_tokens": 96 } }),
            &mut usage,
        );
        assert_eq!(usage.input_tokens, 250);
        assert_eq!(usage.output_tokens, 96);
    }

    #[test]
    fn openai_stream_trailing_usage_chunk() {
        let mut usage = Usage::default();
        apply_stream_event(
            "openai",
            &json!({ "choices": [{ "delta": { "content": "hi" } }], "usage": null }),
            &mut usage,
        );
        assert_eq!(usage, Usage::default());

        apply_stream_event(
            "openai",
            &json!({ "choices": [], "usage": { "prompt_tokens": 90, "completion_tokens": 41 } }),
            &mut usage,
        );
        assert_eq!(usage.input_tokens, 90);
        assert_eq!(usage.output_tokens, 41);
    }

    #[test]
    fn text_deltas_per_provider() {
        let anthropic = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "Hello" }
        });
        assert_eq!(extract_text_delta("anthropic", &anthropic), Some("Hello"));

        let openai = json!({ "choices": [{ "delta": { "content": " world" } }] });
        assert_eq!(extract_text_delta("openai", &openai), Some(" world"));

        let ping = json!({ "type": "ping" });
        assert_eq!(extract_text_delta("anthropic", &ping), None);
    }

    #[test]
    fn openai_estimate_counts_framing_overhead() {
        let body = json!({ "messages": [{ "role": "user", "content": "hello world" }] });
        let estimate = estimate_request_tokens(WireShape::OpenAi, &body);
        // 3 (reply priming) + 3 (message) + tokens("user") + tokens("hello world")
        assert!(estimate >= 8, "estimate {estimate} too low");
    }

    #[test]
    fn anthropic_estimate_applies_correction_factor() {
        let body = json!({
            "system": "x".repeat(400),
            "messages": [{ "role": "user", "content": "y".repeat(400) }]
        });
        // 800 bytes / 4 = 200, + 4 overhead, * 1.1 = 224
        assert_eq!(estimate_request_tokens(WireShape::Anthropic, &body), 224);
    }

    #[test]
    fn char_fallback_estimate() {
        assert_eq!(estimate_output_from_chars(&"a".repeat(400)), 100);
    }

    #[test]
    fn google_estimate_applies_correction_factor() {
        let contents = json!([
            { "parts": [ { "text": "x".repeat(200) }, "y".repeat(200) ] }
        ]);
        // 400 bytes / 4 = 100, * 1.05 = 105
        assert_eq!(estimate_google(&contents, None), 105);
    }
}
