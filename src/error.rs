//! Proxy Error Types
//!
//! Every failure that reaches a client is rendered through one stable JSON
//! envelope:
//!
//!   { "error": { "type": "<kind>", "message": "<text>", "details": {...} } }
//!
//! Status codes are part of the contract and must not drift:
//! - budget_exceeded     -> 429
//! - security_violation  -> 403
//! - missing_api_key     -> 401
//! - invalid_api_key     -> 403
//! - timeout             -> 504
//! - proxy_error         -> 502
//! - upstream_error      -> pass-through of the upstream status

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced to proxy clients.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing API key")]
    MissingApiKey { message: String },

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("budget exceeded")]
    BudgetExceeded {
        budget_name: String,
        remaining_usd: Decimal,
    },

    #[error("security violation")]
    SecurityViolation {
        threat_types: Vec<String>,
        max_severity: String,
        max_confidence: f64,
    },

    #[error("malformed request body")]
    MalformedBody { message: String },

    #[error("upstream timeout")]
    Timeout,

    #[error("upstream connection failed")]
    Network { message: String },

    #[error("upstream returned an error")]
    Upstream { status: u16, body: String },
}

impl ProxyError {
    fn kind(&self) -> &'static str {
        match self {
            Self::MissingApiKey { .. } => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::SecurityViolation { .. } => "security_violation",
            Self::MalformedBody { .. } => "invalid_request",
            Self::Timeout => "timeout",
            Self::Network { .. } => "proxy_error",
            Self::Upstream { .. } => "upstream_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let kind = self.kind();

        let (status, body) = match self {
            ProxyError::MissingApiKey { message } => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({
                    "error": { "type": kind, "message": message }
                }),
            ),
            ProxyError::InvalidApiKey => (
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "error": {
                        "type": kind,
                        "message": "API key is unknown or has been revoked"
                    }
                }),
            ),
            ProxyError::BudgetExceeded {
                budget_name,
                remaining_usd,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({
                    "error": {
                        "type": kind,
                        "message": "Budget limit exceeded. Increase your budget or wait for reset.",
                        "details": {
                            "budget": budget_name,
                            "remaining_usd": remaining_usd,
                        }
                    }
                }),
            ),
            ProxyError::SecurityViolation {
                threat_types,
                max_severity,
                max_confidence,
            } => (
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "error": {
                        "type": kind,
                        "message": "Request blocked by security policy",
                        "details": {
                            "threat_types": threat_types,
                            "max_severity": max_severity,
                            "max_confidence": max_confidence,
                        }
                    }
                }),
            ),
            ProxyError::MalformedBody { message } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": { "type": kind, "message": message }
                }),
            ),
            ProxyError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({
                    "error": { "type": kind, "message": "Upstream request timed out" }
                }),
            ),
            ProxyError::Network { message } => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "error": { "type": kind, "message": message }
                }),
            ),
            ProxyError::Upstream { status, body } => {
                // Relocate the upstream error body into the envelope; if it is
                // not JSON, carry it as a plain string.
                let upstream: serde_json::Value = serde_json::from_str(&body)
                    .unwrap_or_else(|_| serde_json::Value::String(body));
                (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                    serde_json::json!({
                        "error": {
                            "type": kind,
                            "message": "Upstream provider returned an error",
                            "details": {
                                "upstream_status": status,
                                "upstream_error": upstream,
                            }
                        }
                    }),
                )
            }
        };

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_is_429() {
        let err = ProxyError::BudgetExceeded {
            budget_name: "monthly".into(),
            remaining_usd: Decimal::ZERO,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn security_violation_is_403() {
        let err = ProxyError::SecurityViolation {
            threat_types: vec!["prompt_injection".into()],
            max_severity: "critical".into(),
            max_confidence: 0.9,
        };
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn missing_key_carries_www_authenticate() {
        let err = ProxyError::MissingApiKey {
            message: "Missing API key".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).map(|v| v.as_bytes()),
            Some(&b"Bearer"[..])
        );
    }

    #[test]
    fn upstream_status_passes_through() {
        let err = ProxyError::Upstream {
            status: 422,
            body: r#"{"error":"bad model"}"#.into(),
        };
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
