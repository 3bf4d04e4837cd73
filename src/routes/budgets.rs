//! Budget Administration
//!
//! Routes:
//! - POST /v1/budgets - create a budget
//! - GET /v1/budgets - list the caller's budgets
//! - GET /v1/budgets/status - per-budget percent-used and status level
//! - POST /v1/budgets/:id/reset - reset spend and thresholds now
//! - DELETE /v1/budgets/:id - soft delete

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::budget::{next_reset, Budget, BudgetAction, BudgetPeriod, BudgetScope};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateBudgetRequest {
    pub name: String,
    pub scope: BudgetScope,
    #[serde(default)]
    pub scope_identifier: Option<String>,
    pub period: BudgetPeriod,
    pub limit_usd: Decimal,
    #[serde(default = "default_warning")]
    pub warning_threshold_percent: u8,
    #[serde(default = "default_critical")]
    pub critical_threshold_percent: u8,
    pub action_on_breach: BudgetAction,
    #[serde(default)]
    pub downgrade_model: Option<String>,
}

fn default_warning() -> u8 {
    80
}

fn default_critical() -> u8 {
    95
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/budgets", post(create_budget).get(list_budgets))
        .route("/budgets/status", get(budget_status))
        .route("/budgets/:id/reset", post(reset_budget))
        .route("/budgets/:id", delete(deactivate_budget))
}

/// POST /v1/budgets
async fn create_budget(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<CreateBudgetRequest>,
) -> Response {
    if request.limit_usd <= Decimal::ZERO {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": { "type": "invalid_request", "message": "limit_usd must be positive" }
            })),
        )
            .into_response();
    }

    let budget = Budget {
        id: Uuid::new_v4(),
        user_id: principal.user_id,
        name: request.name,
        scope: request.scope,
        scope_identifier: request.scope_identifier,
        period: request.period,
        limit_usd: request.limit_usd,
        current_spend_usd: Decimal::ZERO,
        warning_threshold_percent: request.warning_threshold_percent,
        critical_threshold_percent: request.critical_threshold_percent,
        action_on_breach: request.action_on_breach,
        downgrade_model: request.downgrade_model,
        reset_at: next_reset(request.period, Utc::now()),
        is_active: true,
    };

    tracing::info!(
        user_id = %principal.user_id,
        budget_id = %budget.id,
        limit = %budget.limit_usd,
        scope = ?budget.scope,
        "budget created"
    );

    let snapshot = budget.clone();
    state.store.insert_budget(budget);
    (StatusCode::CREATED, Json(snapshot)).into_response()
}

/// GET /v1/budgets
async fn list_budgets(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    let budgets: Vec<Budget> = state
        .store
        .budgets_for(principal.user_id)
        .iter()
        .map(|entry| entry.snapshot())
        .collect();
    Json(serde_json::json!({ "data": budgets })).into_response()
}

/// GET /v1/budgets/status
async fn budget_status(State(state): State<Arc<AppState>>, principal: Principal) -> Response {
    let statuses: Vec<serde_json::Value> = state
        .store
        .budgets_for(principal.user_id)
        .iter()
        .map(|entry| {
            let budget = entry.snapshot();
            serde_json::json!({
                "id": budget.id,
                "name": budget.name,
                "period": budget.period,
                "scope": budget.scope,
                "limit_usd": budget.limit_usd,
                "current_spend_usd": budget.current_spend_usd,
                "remaining_usd": budget.remaining_usd(),
                "percent_used": budget.percent_used(),
                "status": budget.status_level(),
                "reset_at": budget.reset_at,
                "is_active": budget.is_active,
            })
        })
        .collect();
    Json(serde_json::json!({ "data": statuses })).into_response()
}

/// POST /v1/budgets/:id/reset
async fn reset_budget(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(budget_id): Path<Uuid>,
) -> Response {
    let owned = state
        .store
        .budget_entry(budget_id)
        .map(|entry| entry.snapshot().user_id == principal.user_id)
        .unwrap_or(false);

    if owned && state.budget.reset(budget_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found()
    }
}

/// DELETE /v1/budgets/:id
async fn deactivate_budget(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(budget_id): Path<Uuid>,
) -> Response {
    if state.store.deactivate_budget(budget_id, principal.user_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found()
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": { "type": "not_found", "message": "No such budget" }
        })),
    )
        .into_response()
}
