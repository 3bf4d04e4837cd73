//! Provider-compatible proxy routes
//!
//! Both endpoints accept the provider's own request shape byte-for-byte and
//! hand it to the pipeline; the body is forwarded unchanged apart from a
//! possible `model` substitution. Upstream credentials are pass-through
//! headers, never stored.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::pipeline;
use crate::providers::WireShape;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages", post(anthropic_messages))
        .route("/chat/completions", post(chat_completions))
        .route("/streams/:request_id/continuation", get(stream_continuation))
}

/// POST /v1/messages - Anthropic Messages shape
async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    pipeline::handle_proxy_request(state, WireShape::Anthropic, principal, headers, body).await
}

/// POST /v1/chat/completions - OpenAI Chat Completions shape
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    pipeline::handle_proxy_request(state, WireShape::OpenAi, principal, headers, body).await
}

/// GET /v1/streams/:request_id/continuation
///
/// After a terminated stream: the original messages plus the partial
/// assistant turn, so the caller can re-issue with a different model.
/// Single fetch; the context is dropped once read.
async fn stream_continuation(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(request_id): Path<Uuid>,
) -> Response {
    match state.stream_contexts.take_continuation(request_id) {
        Some(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "type": "not_found", "message": "No preserved context for that stream" }
            })),
        )
            .into_response(),
    }
}
