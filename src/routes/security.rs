//! Security Administration and Observability
//!
//! Routes:
//! - GET /v1/security/detectors - detector registry status
//! - POST /v1/security/detectors/:name - enable or disable one detector
//! - GET /v1/security/quarantine - the caller's quarantined requests
//! - GET /v1/security/kills - pending kill requests for the caller's agents
//! - POST /v1/security/policies - per-agent policy (mode, auto-kill)
//! - POST /v1/security/indicators - add a threat-intel indicator
//! - DELETE /v1/security/indicators - remove one
//! - POST /v1/security/rules - add a tenant-scoped custom rule

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::security::detectors::rules::{CustomRule, CustomRuleKind};
use crate::security::types::{Severity, ThreatType};
use crate::security::{AgentSecurityPolicy, IocType, ThreatIndicator};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DetectorToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct IndicatorRequest {
    pub ioc_type: IocType,
    pub value: String,
    pub severity: Severity,
    #[serde(default = "default_threat_type")]
    pub threat_type: ThreatType,
    pub source: String,
}

fn default_threat_type() -> ThreatType {
    ThreatType::NetworkAbuse
}

#[derive(Debug, Deserialize)]
pub struct IndicatorRemoveRequest {
    pub ioc_type: IocType,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct CustomRuleRequest {
    pub name: String,
    #[serde(flatten)]
    pub kind: CustomRuleKind,
    pub severity: Severity,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/security/detectors", get(detector_status))
        .route("/security/detectors/:name", post(toggle_detector))
        .route("/security/quarantine", get(quarantine_list))
        .route("/security/kills", get(kill_list))
        .route("/security/policies", post(set_policy))
        .route(
            "/security/indicators",
            post(add_indicator).delete(remove_indicator),
        )
        .route("/security/rules", post(add_custom_rule))
}

/// GET /v1/security/detectors
async fn detector_status(State(state): State<Arc<AppState>>, _principal: Principal) -> Response {
    Json(serde_json::json!({ "data": state.security.detector_status() })).into_response()
}

/// POST /v1/security/detectors/:name
async fn toggle_detector(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(name): Path<String>,
    Json(request): Json<DetectorToggleRequest>,
) -> Response {
    if state.security.set_detector_enabled(&name, request.enabled) {
        tracing::info!(detector = %name, enabled = request.enabled, "detector toggled");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "type": "not_found", "message": "No such detector" }
            })),
        )
            .into_response()
    }
}

/// GET /v1/security/quarantine
async fn quarantine_list(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    Json(serde_json::json!({ "data": state.store.quarantine_list(principal.user_id) }))
        .into_response()
}

/// GET /v1/security/kills
async fn kill_list(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    Json(serde_json::json!({ "data": state.store.kill_requests(principal.user_id) }))
        .into_response()
}

/// POST /v1/security/policies
async fn set_policy(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(policy): Json<AgentSecurityPolicy>,
) -> Response {
    tracing::info!(agent = %policy.agent_id, mode = %policy.mode, "agent security policy set");
    state.security.set_policy(policy);
    StatusCode::NO_CONTENT.into_response()
}

/// POST /v1/security/indicators
async fn add_indicator(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(request): Json<IndicatorRequest>,
) -> Response {
    state.security.add_indicator(ThreatIndicator {
        ioc_type: request.ioc_type,
        value: request.value,
        severity: request.severity,
        threat_type: request.threat_type,
        source: request.source,
    });
    StatusCode::CREATED.into_response()
}

/// DELETE /v1/security/indicators
async fn remove_indicator(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(request): Json<IndicatorRemoveRequest>,
) -> Response {
    state.security.remove_indicator(request.ioc_type, &request.value);
    StatusCode::NO_CONTENT.into_response()
}

/// POST /v1/security/rules
async fn add_custom_rule(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<CustomRuleRequest>,
) -> Response {
    let rule = CustomRule {
        id: Uuid::new_v4(),
        user_id: principal.user_id,
        name: request.name,
        kind: request.kind,
        severity: request.severity,
        enabled: true,
    };
    let snapshot = rule.clone();
    state.store.put_custom_rule(rule);
    (StatusCode::CREATED, Json(snapshot)).into_response()
}
