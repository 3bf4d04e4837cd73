//! accgate - LLM API Proxy with Budget Enforcement and Runtime Security
//!
//! Every request on the provider-compatible routes runs one pipeline:
//! - Authenticate the issued key (acc_ prefix, SHA-256 at rest)
//! - Check spend budgets (allow / warn / downgrade / block)
//! - Apply smart routing rules (cheaper or mandated models)
//! - Run the security detectors (sync inline, async off-path)
//! - Forward upstream (streaming via the interceptor, which can kill
//!   a stream mid-flight)
//! - Meter authoritative usage, price it, debit budgets, journal
//!
//! Upstream credentials are pass-through from the client; the proxy holds
//! no provider secrets unless the operator configures defaults.

mod auth;
mod budget;
mod config;
mod cost;
mod error;
mod forward;
mod journal;
mod pipeline;
mod pricing;
mod providers;
mod router;
mod routes;
mod security;
mod storage;
mod stream;
mod tokens;

use anyhow::Result;
use axum::{routing::get, Router};
use chrono::Utc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::budget::BudgetEngine;
use crate::config::Config;
use crate::forward::Forwarder;
use crate::journal::Journal;
use crate::pricing::PricingRegistry;
use crate::router::SmartRouter;
use crate::security::SecurityEngine;
use crate::storage::Store;
use crate::stream::StreamContexts;

/// Shared application state
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub pricing: Arc<PricingRegistry>,
    pub budget: BudgetEngine,
    pub router: SmartRouter,
    pub security: Arc<SecurityEngine>,
    pub forwarder: Forwarder,
    pub journal: Journal,
    pub stream_contexts: StreamContexts,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accgate=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing::info!(
        "Starting accgate on port {} (security mode: {})",
        config.port,
        config.security_mode.as_str()
    );
    tracing::info!(
        "Pass-through default keys configured: Anthropic={}, OpenAI={}, Google={}, DeepSeek={}, Groq={}, Mistral={}, xAI={}",
        config.anthropic_api_key.is_some(),
        config.openai_api_key.is_some(),
        config.google_api_key.is_some(),
        config.deepseek_api_key.is_some(),
        config.groq_api_key.is_some(),
        config.mistral_api_key.is_some(),
        config.xai_api_key.is_some()
    );

    let store = Arc::new(Store::new());
    let pricing = Arc::new(PricingRegistry::new());
    let security = SecurityEngine::new(&config, store.clone());
    let journal = Journal::new(store.clone(), config.journal_capacity);

    // A fresh store has no issued keys; mint one so the control plane is
    // reachable. Shown once, in the startup log.
    bootstrap_api_key(&store);

    let state = Arc::new(AppState {
        budget: BudgetEngine::new(store.clone()),
        router: SmartRouter::new(store.clone(), pricing.clone()),
        forwarder: Forwarder::new(&config)?,
        journal,
        security,
        pricing,
        store,
        stream_contexts: StreamContexts::default(),
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        // Health checks (no auth required)
        .route("/health", get(routes::health::health_check))
        .route("/ready", get(routes::health::readiness_check))
        // Provider-compatible proxy routes
        .nest("/v1", routes::chat::router())
        // Control plane
        .nest("/v1", routes::keys::router())
        .nest("/v1", routes::budgets::router())
        .nest("/v1", routes::routing::router())
        .nest("/v1", routes::pricing::router())
        .nest("/v1", routes::security::router())
        .nest("/v1", routes::logs::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("accgate listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Mint the first issued key for a fresh store and log it once.
fn bootstrap_api_key(store: &Store) {
    let (key, key_hash, key_prefix) = auth::generate_api_key();
    let record = auth::ApiKeyRecord {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        agent_id: None,
        name: "bootstrap".to_string(),
        key_prefix,
        key_hash,
        tier: auth::Tier::Standard,
        is_active: true,
        created_at: Utc::now(),
        last_used_at: None,
    };
    tracing::info!(
        user_id = %record.user_id,
        "bootstrap API key (shown once): {key}"
    );
    store.insert_api_key(record);
}
