//! Routing Rule Administration
//!
//! Routes:
//! - POST /v1/routing/rules - create a rule
//! - GET /v1/routing/rules - list the caller's rules with counters
//! - DELETE /v1/routing/rules/:id - disable
//! - POST /v1/routing/simulate - dry-run the router for a request
//! - GET /v1/routing/cheapest - cheapest model meeting a capability filter
//! - GET /v1/routing/fallbacks/:model - the static fallback chain

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::router::{CapabilityFilter, RoutingRule, RuleCondition};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub priority: i32,
    #[serde(default)]
    pub condition: RuleCondition,
    pub target_provider: String,
    pub target_model: String,
}

/// Query-string form of the capability filter; `providers` is a
/// comma-separated list.
#[derive(Debug, Default, Deserialize)]
pub struct CheapestQuery {
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
    pub min_context_window: Option<u64>,
    pub min_output_tokens: Option<u64>,
    pub providers: Option<String>,
}

impl CheapestQuery {
    fn into_filter(self) -> CapabilityFilter {
        CapabilityFilter {
            supports_vision: self.supports_vision,
            supports_streaming: self.supports_streaming,
            supports_function_calling: self.supports_function_calling,
            min_context_window: self.min_context_window,
            min_output_tokens: self.min_output_tokens,
            providers: self.providers.map(|list| {
                list.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub model: String,
    pub available: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct FallbackQuery {
    /// Extra models to treat as unavailable, comma-separated
    pub unavailable: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/routing/rules", post(create_rule).get(list_rules))
        .route("/routing/rules/:id", delete(disable_rule))
        .route("/routing/simulate", post(simulate))
        .route("/routing/cheapest", get(cheapest))
        .route("/routing/fallbacks/:model", get(fallback_chain))
        .route("/routing/availability", post(set_availability))
}

/// POST /v1/routing/rules
async fn create_rule(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<CreateRuleRequest>,
) -> Response {
    let rule = RoutingRule {
        id: Uuid::new_v4(),
        user_id: principal.user_id,
        name: request.name,
        priority: request.priority,
        condition: request.condition,
        target_provider: request.target_provider,
        target_model: request.target_model,
        is_active: true,
        times_applied: 0,
        estimated_savings_usd: Decimal::ZERO,
    };
    let snapshot = rule.clone();
    state.store.insert_rule(rule);

    tracing::info!(user_id = %principal.user_id, rule_id = %snapshot.id, "routing rule created");
    (StatusCode::CREATED, Json(snapshot)).into_response()
}

/// GET /v1/routing/rules
async fn list_rules(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    Json(serde_json::json!({ "data": state.store.rules_for(principal.user_id) })).into_response()
}

/// DELETE /v1/routing/rules/:id
async fn disable_rule(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(rule_id): Path<Uuid>,
) -> Response {
    if state.store.disable_rule(rule_id, principal.user_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "type": "not_found", "message": "No such routing rule" }
            })),
        )
            .into_response()
    }
}

/// POST /v1/routing/simulate
///
/// Dry-run: shows what the router would do without touching rule counters.
async fn simulate(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<SimulateRequest>,
) -> Response {
    let body = serde_json::json!({ "messages": request.messages });
    let decision = state.router.simulate(
        principal.user_id,
        &request.model,
        &body,
        request.system.as_deref(),
    );

    Json(serde_json::json!({
        "original_model": decision.original_model,
        "routed_model": decision.target_model,
        "provider": decision.target_provider,
        "reason": decision.reason,
        "estimated_savings_usd": decision.estimated_savings_usd,
        "rule_id": decision.rule_id,
        "would_route": decision.target_model != decision.original_model,
    }))
    .into_response()
}

/// GET /v1/routing/cheapest
async fn cheapest(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Query(query): Query<CheapestQuery>,
) -> Response {
    let filter = query.into_filter();
    match state.router.cheapest_suitable(&filter) {
        Some(pick) => Json(serde_json::json!(pick)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {
                    "type": "not_found",
                    "message": "No models match the specified requirements"
                }
            })),
        )
            .into_response(),
    }
}

/// GET /v1/routing/fallbacks/:model
///
/// The static chain plus the substitute the router would pick right now.
async fn fallback_chain(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path(model): Path<String>,
    Query(query): Query<FallbackQuery>,
) -> Response {
    let also_unavailable: Vec<String> = query
        .unavailable
        .map(|list| {
            list.split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Json(serde_json::json!({
        "model": model,
        "chain": state.router.fallback_chain(&model),
        "pick": state.router.fallback_model(&model, &also_unavailable),
    }))
    .into_response()
}

/// POST /v1/routing/availability
///
/// Declare a model unavailable upstream (or available again); fallback
/// picks skip unavailable models.
async fn set_availability(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(request): Json<AvailabilityRequest>,
) -> Response {
    if request.available {
        state.router.mark_available(&request.model);
    } else {
        state.router.mark_unavailable(&request.model);
    }
    tracing::info!(model = %request.model, available = request.available, "model availability updated");
    StatusCode::NO_CONTENT.into_response()
}
