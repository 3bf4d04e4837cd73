//! Upstream Forwarder
//!
//! One outbound HTTP call per inbound request. Two clients, one per timeout
//! class: 120 s for unary calls, 180 s for streaming. Failure classes map
//! distinctly: timeout -> 504, connection -> 502, upstream non-2xx -> the
//! upstream status with its error body relocated into the envelope.

use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

use crate::config::Config;
use crate::error::ProxyError;
use crate::providers::{AuthStyle, ProviderProfile};

pub struct Forwarder {
    unary: reqwest::Client,
    streaming: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            unary: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.unary_timeout_secs))
                .build()?,
            streaming: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.stream_timeout_secs))
                .build()?,
        })
    }

    /// Send the request body upstream with the provider's credential
    /// convention. A non-2xx upstream answer comes back as `ProxyError`;
    /// a successful response is handed to the caller unread.
    pub async fn forward(
        &self,
        profile: &ProviderProfile,
        api_key: &str,
        body: &Value,
        streaming: bool,
    ) -> Result<reqwest::Response, ProxyError> {
        let client = if streaming { &self.streaming } else { &self.unary };
        let url = profile.chat_url();

        let mut request = client.post(&url).header("Content-Type", "application/json");

        request = match profile.auth {
            AuthStyle::XApiKey => request.header("x-api-key", api_key),
            AuthStyle::Bearer => request.header("Authorization", format!("Bearer {api_key}")),
            AuthStyle::QueryKey => request.query(&[("key", api_key)]),
        };

        for (name, value) in profile.extra_headers {
            request = request.header(*name, *value);
        }

        let response = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout
            } else {
                ProxyError::Network {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = profile.name,
                status = status.as_u16(),
                error_preview = %error_body.chars().take(500).collect::<String>(),
                "upstream returned error"
            );
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                body: error_body,
            });
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::profile;

    fn config() -> Config {
        use crate::config::SecurityMode;
        use rust_decimal_macros::dec;
        Config {
            port: 0,
            estimated_cost_usd: dec!(0.10),
            security_mode: SecurityMode::Enforce,
            detector_workers: 4,
            async_detector_timeout_secs: 30,
            journal_capacity: 16,
            stream_check_chunks: 10,
            stream_check_bytes: 4096,
            unary_timeout_secs: 120,
            stream_timeout_secs: 180,
            anthropic_api_key: None,
            openai_api_key: None,
            google_api_key: None,
            deepseek_api_key: None,
            groq_api_key: None,
            mistral_api_key: None,
            xai_api_key: None,
        }
    }

    #[test]
    fn builds_clients_for_both_timeout_classes() {
        assert!(Forwarder::new(&config()).is_ok());
    }

    #[tokio::test]
    async fn connection_failure_maps_to_network_error() {
        let mut short = config();
        short.unary_timeout_secs = 2;
        let forwarder = Forwarder::new(&short).unwrap();
        // Reserved TEST-NET address: connection cannot succeed.
        let profile = ProviderProfile {
            name: "anthropic",
            base_url: "http://192.0.2.1:9",
            auth: crate::providers::AuthStyle::XApiKey,
            shape: crate::providers::WireShape::Anthropic,
            extra_headers: &[],
        };
        let body = serde_json::json!({ "model": "claude-sonnet-4-5", "messages": [] });
        let result = forwarder.forward(&profile, "sk-test", &body, false).await;
        assert!(matches!(
            result,
            Err(ProxyError::Network { .. }) | Err(ProxyError::Timeout)
        ));
    }

    #[test]
    fn known_profiles_resolve() {
        for name in ["anthropic", "openai", "deepseek", "groq", "mistral"] {
            assert!(profile(name).is_some(), "missing profile for {name}");
        }
    }
}
