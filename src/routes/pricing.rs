//! Pricing Catalog Routes
//!
//! Routes:
//! - GET /v1/pricing - the compiled-in catalog (optionally one provider)
//! - GET /v1/pricing/:provider/:model - effective pricing right now
//! - POST /v1/pricing - install a price override record

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::Principal;
use crate::pricing::ModelDescriptor;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertPriceRequest {
    pub provider: String,
    pub model: String,
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
    #[serde(default)]
    pub cache_create_per_mtok: Decimal,
    #[serde(default)]
    pub cache_read_per_mtok: Decimal,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_to: Option<DateTime<Utc>>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pricing", get(catalog).post(upsert_price))
        .route("/pricing/:provider/:model", get(lookup_price))
}

/// GET /v1/pricing
async fn catalog(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Query(query): Query<CatalogQuery>,
) -> Response {
    match query.provider {
        Some(provider) => {
            let models = state.pricing.models_for_provider(&provider);
            Json(serde_json::json!({ "provider": provider, "models": models })).into_response()
        }
        None => {
            let models = state.pricing.all_models();
            Json(serde_json::json!({ "data": models })).into_response()
        }
    }
}

/// GET /v1/pricing/:provider/:model
async fn lookup_price(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Path((provider, model)): Path<(String, String)>,
) -> Response {
    let descriptor = state.pricing.lookup(&provider, &model, Utc::now());
    Json(descriptor).into_response()
}

/// POST /v1/pricing
async fn upsert_price(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Json(request): Json<UpsertPriceRequest>,
) -> Response {
    let descriptor = ModelDescriptor {
        provider: request.provider,
        model: request.model,
        input_per_mtok: request.input_per_mtok,
        output_per_mtok: request.output_per_mtok,
        cache_create_per_mtok: request.cache_create_per_mtok,
        cache_read_per_mtok: request.cache_read_per_mtok,
        effective_from: request.effective_from.unwrap_or_else(Utc::now),
        effective_to: request.effective_to,
        synthetic: false,
    };

    tracing::info!(
        provider = %descriptor.provider,
        model = %descriptor.model,
        input = %descriptor.input_per_mtok,
        output = %descriptor.output_per_mtok,
        "price override installed"
    );

    let snapshot = descriptor.clone();
    state.pricing.upsert(descriptor);
    (StatusCode::CREATED, Json(snapshot)).into_response()
}
