//! Journal read endpoint
//!
//! Routes:
//! - GET /v1/logs/recent?limit=N - newest journal records for the caller

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::Principal;
use crate::AppState;

const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/logs/recent", get(recent))
}

/// GET /v1/logs/recent
async fn recent(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = query.limit.min(MAX_LIMIT);
    let records = state.store.recent_journal(principal.user_id, limit);
    Json(serde_json::json!({ "data": records })).into_response()
}
