//! Issued API Key Management
//!
//! Routes:
//! - POST /v1/keys - mint a new key (the raw key appears only here)
//! - GET /v1/keys - list the caller's keys (metadata only)
//! - DELETE /v1/keys/:id - revoke

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{generate_api_key, ApiKeyRecord, Principal, Tier};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub tier: Option<Tier>,
}

#[derive(Debug, Serialize)]
pub struct CreatedKeyResponse {
    pub id: Uuid,
    pub name: String,
    /// Shown exactly once; only the hash is stored
    pub key: String,
    pub key_prefix: String,
    pub tier: Tier,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keys", post(create_key).get(list_keys))
        .route("/keys/:id", axum::routing::delete(revoke_key))
}

/// POST /v1/keys
async fn create_key(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<CreateKeyRequest>,
) -> Response {
    let (key, key_hash, key_prefix) = generate_api_key();
    let record = ApiKeyRecord {
        id: Uuid::new_v4(),
        user_id: principal.user_id,
        agent_id: request.agent_id,
        name: request.name.clone(),
        key_prefix: key_prefix.clone(),
        key_hash,
        tier: request.tier.unwrap_or(principal.tier),
        is_active: true,
        created_at: Utc::now(),
        last_used_at: None,
    };
    let response = CreatedKeyResponse {
        id: record.id,
        name: record.name.clone(),
        key,
        key_prefix,
        tier: record.tier,
    };
    state.store.insert_api_key(record);

    tracing::info!(
        user_id = %principal.user_id,
        key_id = %response.id,
        tier = response.tier.as_str(),
        "api key created"
    );
    (StatusCode::CREATED, Json(response)).into_response()
}

/// GET /v1/keys
async fn list_keys(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    let keys = state.store.keys_for_user(principal.user_id);
    Json(serde_json::json!({ "data": keys })).into_response()
}

/// DELETE /v1/keys/:id
async fn revoke_key(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
) -> Response {
    if state.store.revoke_api_key(key_id, principal.user_id) {
        tracing::info!(user_id = %principal.user_id, key_id = %key_id, "api key revoked");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "type": "not_found", "message": "No such API key" }
            })),
        )
            .into_response()
    }
}
