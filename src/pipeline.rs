//! Request Pipeline
//!
//! The per-request orchestrator: authenticate (done by the extractor) ->
//! budget pre-check -> smart routing -> security analysis -> forward
//! (streaming or unary) -> meter -> cost -> debit -> journal. Decision
//! outcomes short-circuit exactly as specified; everything after the
//! response is fail-open.
//!
//! Every path that produced a decision — allowed, blocked, failed upstream —
//! leaves exactly one journal record carrying this request's id.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Principal;
use crate::budget::BudgetDecision;
use crate::cost::calculate_cost;
use crate::error::ProxyError;
use crate::journal::JournalRecord;
use crate::providers::{self, WireShape};
use crate::security::types::{ResponseAction, ScanContext};
use crate::stream::{self, StreamParams};
use crate::tokens;
use crate::AppState;

/// Everything about one in-flight request the pipeline threads through.
struct RequestFlight {
    request_id: Uuid,
    started: Instant,
    principal: Principal,
    agent_str: Option<String>,
    endpoint: &'static str,
    model_original: String,
    model_effective: String,
    provider: String,
    streaming: bool,
}

impl RequestFlight {
    fn latency_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn scan_ctx(&self) -> ScanContext {
        ScanContext {
            user_id: self.principal.user_id,
            agent_id: self.agent_str.clone(),
            request_id: self.request_id,
        }
    }

    fn journal_record(&self, usage: tokens::Usage, cost: Decimal, status: u16) -> JournalRecord {
        JournalRecord {
            request_id: self.request_id,
            user_id: self.principal.user_id,
            agent_id: self.principal.agent_id,
            provider: self.provider.clone(),
            model_original: self.model_original.clone(),
            model_effective: self.model_effective.clone(),
            endpoint: self.endpoint.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cost_usd: cost,
            latency_ms: self.latency_ms(),
            status_code: status,
            streaming: self.streaming,
            timestamp: Utc::now(),
        }
    }
}

/// Handle one proxied chat request in either wire shape.
pub async fn handle_proxy_request(
    state: Arc<AppState>,
    shape: WireShape,
    principal: Principal,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    // 3. Decode body and pull out the routed fields.
    let mut request_data: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return ProxyError::MalformedBody {
                message: format!("Request body is not valid JSON: {e}"),
            }
            .into_response();
        }
    };

    let default_model = match shape {
        WireShape::Anthropic => "claude-sonnet-4-5",
        WireShape::OpenAi => "gpt-4o",
    };
    let model_original = request_data
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(default_model)
        .to_string();
    let streaming = request_data
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let system = request_data
        .get("system")
        .and_then(Value::as_str)
        .map(str::to_string);
    let endpoint = match shape {
        WireShape::Anthropic => "/v1/messages",
        WireShape::OpenAi => "/v1/chat/completions",
    };

    let mut flight = RequestFlight {
        request_id,
        started,
        agent_str: principal.agent_id.map(|a| a.to_string()),
        principal,
        endpoint,
        model_original: model_original.clone(),
        model_effective: model_original.clone(),
        provider: String::new(),
        streaming,
    };

    // 4. Pre-flight estimate. The token count informs routing and logs; the
    // budget pre-check uses the fixed conservative cost estimate.
    let estimated_tokens = tokens::estimate_request_tokens(shape, &request_data);
    let estimated_cost = state.config.estimated_cost_usd;

    // 5. Budget pre-check.
    let mut budget_header: Option<&'static str> = None;
    match state.budget.check_budget(
        flight.principal.user_id,
        flight.agent_str.as_deref(),
        &flight.model_effective,
        estimated_cost,
    ) {
        BudgetDecision::Allow => {}
        BudgetDecision::Warn { budget_name, percent_used } => {
            tracing::debug!(
                request_id = %request_id,
                budget = %budget_name,
                percent = percent_used,
                "budget warning attached"
            );
            budget_header = Some("warning");
        }
        BudgetDecision::Downgrade { target_model } => {
            tracing::info!(
                request_id = %request_id,
                from = %flight.model_effective,
                to = %target_model,
                "budget downgrade applied"
            );
            flight.model_effective = target_model;
            budget_header = Some("downgraded");
        }
        BudgetDecision::Block { budget_name, remaining_usd } => {
            flight.provider = providers::infer_provider(&flight.model_original).to_string();
            state
                .journal
                .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, 429));
            let mut response = ProxyError::BudgetExceeded {
                budget_name,
                remaining_usd,
            }
            .into_response();
            attach_header(&mut response, "x-acc-request-id", &request_id.to_string());
            attach_header(&mut response, "x-acc-budget-status", "exceeded");
            return response;
        }
    }

    // 6. Smart routing on the (possibly downgraded) model.
    let routing = state.router.route_request(
        flight.principal.user_id,
        flight.agent_str.as_deref(),
        &flight.model_effective,
        &request_data,
        system.as_deref(),
    );
    if routing.target_model != flight.model_effective {
        tracing::info!(
            request_id = %request_id,
            from = %flight.model_effective,
            to = %routing.target_model,
            reason = %routing.reason,
            "routing substitution"
        );
    }
    flight.model_effective = routing.target_model.clone();
    flight.provider = routing.target_provider.clone();
    if flight.model_effective != model_original {
        request_data["model"] = Value::String(flight.model_effective.clone());
    }

    tracing::debug!(
        request_id = %request_id,
        model = %flight.model_effective,
        provider = %flight.provider,
        estimated_tokens,
        streaming,
        "request admitted"
    );

    // 7. Security analysis of the request.
    let scan_ctx = flight.scan_ctx();
    let summary = state.security.analyze_request(&request_data, &scan_ctx).await;
    let mut security_header: Option<&'static str> = None;
    if summary.detected {
        tracing::debug!(
            request_id = %request_id,
            threats = ?summary.threat_type_names(),
            actions = ?summary.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            "security findings on request"
        );
        if summary.requires(ResponseAction::Quarantine) {
            state.security.quarantine(&request_data, &summary, &scan_ctx);
        }

        let quarantine_blocks = summary.requires(ResponseAction::Quarantine)
            && state.config.security_mode == crate::config::SecurityMode::Enforce;
        if summary.requires(ResponseAction::Block) || quarantine_blocks {
            state
                .journal
                .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, 403));
            let mut response = ProxyError::SecurityViolation {
                threat_types: summary.threat_type_names(),
                max_severity: summary
                    .max_severity
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                max_confidence: summary.max_confidence,
            }
            .into_response();
            attach_header(&mut response, "x-acc-request-id", &request_id.to_string());
            attach_header(&mut response, "x-acc-security-status", "blocked");
            return response;
        }

        if summary.requires(ResponseAction::Warn) {
            security_header = Some("warning");
        }
    }

    // 8. Resolve the provider profile and pass-through credential.
    let profile = providers::profile(&flight.provider)
        .or_else(|| providers::profile(providers::infer_provider(&flight.model_effective)));
    let Some(profile) = profile else {
        state
            .journal
            .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, 502));
        return ProxyError::Network {
            message: format!("No upstream profile for provider '{}'", flight.provider),
        }
        .into_response();
    };

    let credential = providers::passthrough_credential(profile.shape, &headers)
        .or_else(|| state.config.provider_default_key(profile.name).map(str::to_string));
    let Some(credential) = credential else {
        state
            .journal
            .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, 401));
        return ProxyError::MissingApiKey {
            message: format!(
                "Missing {} API key for upstream; include the provider credential header",
                profile.name
            ),
        }
        .into_response();
    };

    // 9. Forward.
    let upstream = match state
        .forwarder
        .forward(profile, &credential, &request_data, streaming)
        .await
    {
        Ok(response) => response,
        Err(error) => {
            let status = match &error {
                ProxyError::Timeout => 504,
                ProxyError::Upstream { status, .. } => *status,
                _ => 502,
            };
            state
                .journal
                .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, status));
            let mut response = error.into_response();
            attach_header(&mut response, "x-acc-request-id", &request_id.to_string());
            return response;
        }
    };

    // 10. Streaming: hand over to the interceptor, which owns metering,
    // debit, and the journal record for this request.
    if streaming {
        let messages = request_data
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let params = StreamParams {
            provider: profile.name.to_string(),
            request_id,
            principal: flight.principal.clone(),
            model_original: flight.model_original.clone(),
            model_effective: flight.model_effective.clone(),
            endpoint: endpoint.to_string(),
            messages,
            started,
        };
        let mut response = stream::create_streaming_response(state, upstream, params).await;
        if let Some(status) = budget_header {
            attach_header(&mut response, "x-acc-budget-status", status);
        }
        if let Some(status) = security_header {
            attach_header(&mut response, "x-acc-security-status", status);
        }
        return response;
    }

    // 11. Unary: read, meter, bill, journal, respond.
    let upstream_status = upstream.status();
    let response_bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            state
                .journal
                .append_detached(flight.journal_record(tokens::Usage::default(), Decimal::ZERO, 502));
            return ProxyError::Network {
                message: format!("Failed reading upstream response: {e}"),
            }
            .into_response();
        }
    };

    let response_data: Value = serde_json::from_slice(&response_bytes).unwrap_or(Value::Null);
    let usage = tokens::extract_usage(profile.name, &response_data);
    let descriptor = state
        .pricing
        .lookup(profile.name, &flight.model_effective, Utc::now());
    let cost = calculate_cost(&usage, &descriptor);

    state.budget.debit(
        flight.principal.user_id,
        cost,
        flight.agent_str.as_deref(),
        Some(&flight.model_effective),
    );

    // Post-hoc response analysis: async detectors fan out, sync findings are
    // logged. Nothing here can alter the response (fail-open).
    if !response_data.is_null() {
        let engine = state.security.clone();
        let response_data = response_data.clone();
        let ctx = flight.scan_ctx();
        tokio::spawn(async move {
            let _ = engine.analyze_response(&response_data, &ctx).await;
        });
    }

    state
        .journal
        .append_detached(flight.journal_record(usage, cost, upstream_status.as_u16()));

    tracing::debug!(
        request_id = %request_id,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total(),
        cost_usd = %cost,
        latency_ms = flight.latency_ms(),
        "request completed"
    );

    // 12. Response headers.
    let mut response = (
        StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK),
        [("Content-Type", "application/json")],
        response_bytes,
    )
        .into_response();
    attach_header(&mut response, "x-acc-request-id", &request_id.to_string());
    attach_header(&mut response, "x-acc-cost", &cost.normalize().to_string());
    attach_header(&mut response, "x-acc-tokens-input", &usage.input_tokens.to_string());
    attach_header(&mut response, "x-acc-tokens-output", &usage.output_tokens.to_string());
    attach_header(&mut response, "x-acc-model-used", &flight.model_effective);
    attach_header(&mut response, "x-acc-latency-ms", &flight.latency_ms().to_string());
    if let Some(status) = budget_header {
        attach_header(&mut response, "x-acc-budget-status", status);
    }
    if let Some(status) = security_header {
        attach_header(&mut response, "x-acc-security-status", status);
        if let Some(severity) = summary.max_severity {
            attach_header(&mut response, "x-acc-threat-level", severity.as_str());
        }
    }

    response
}

fn attach_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        response.headers_mut().insert(name, value);
    }
}
