//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub journal_records: usize,
    pub default_provider_configured: bool,
    pub security_mode: &'static str,
}

/// Liveness probe - is the service running?
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "accgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe. The proxy is credential-less by design, so a missing
/// default provider key only degrades (clients pass their own keys).
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let response = ReadinessResponse {
        status: "ready",
        journal_records: state.store.journal_len(),
        default_provider_configured: state.config.has_default_provider(),
        security_mode: state.config.security_mode.as_str(),
    };

    (StatusCode::OK, Json(response))
}
