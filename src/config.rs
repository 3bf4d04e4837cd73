//! Configuration for accgate
//!
//! All secrets are injected via environment variables at runtime.
//! The source code contains no secrets.
//!
//! Provider API keys configured here are pass-through *defaults*: the proxy
//! itself holds no upstream credentials unless the operator opts in. Clients
//! normally supply the provider key on each request.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// How the security engine's decisions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Full decision table: block, quarantine, kill.
    Enforce,
    /// Blocks are demoted to warnings.
    Warn,
    /// Everything is demoted to log-only.
    Monitor,
}

impl SecurityMode {
    fn parse(s: &str) -> Self {
        match s {
            "monitor" => Self::Monitor,
            "warn" => Self::Warn,
            _ => Self::Enforce,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Warn => "warn",
            Self::Monitor => "monitor",
        }
    }
}

#[derive(Clone)]
pub struct Config {
    /// Port to listen on (default: 9400)
    pub port: u16,

    /// Fixed conservative cost estimate used for the budget pre-check.
    /// Never used for billing.
    pub estimated_cost_usd: Decimal,

    /// Security decision mode: enforce | warn | monitor
    pub security_mode: SecurityMode,

    /// Bounded worker pool size for CPU-bound sync detectors
    pub detector_workers: usize,

    /// Timeout in seconds for async (off-path) detectors
    pub async_detector_timeout_secs: u64,

    /// Bounded journal queue capacity
    pub journal_capacity: usize,

    /// Run the security response analyzer every N stream chunks...
    pub stream_check_chunks: u64,

    /// ...or every K freshly buffered bytes, whichever comes first
    pub stream_check_bytes: usize,

    /// Upstream timeout for unary requests (seconds)
    pub unary_timeout_secs: u64,

    /// Upstream timeout for streaming requests (seconds)
    pub stream_timeout_secs: u64,

    // =========================================================================
    // Pass-through default provider keys (optional)
    // =========================================================================
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
    pub xai_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: std::env::var("ACCGATE_PORT")
                .unwrap_or_else(|_| "9400".to_string())
                .parse()
                .context("Invalid ACCGATE_PORT")?,

            estimated_cost_usd: std::env::var("ACCGATE_ESTIMATED_COST")
                .ok()
                .map(|v| v.parse::<Decimal>().context("Invalid ACCGATE_ESTIMATED_COST"))
                .transpose()?
                .unwrap_or(dec!(0.10)),

            security_mode: SecurityMode::parse(
                &std::env::var("ACCGATE_SECURITY_MODE").unwrap_or_else(|_| "enforce".to_string()),
            ),

            detector_workers: std::env::var("ACCGATE_DETECTOR_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid ACCGATE_DETECTOR_WORKERS")?,

            async_detector_timeout_secs: std::env::var("ACCGATE_ASYNC_DETECTOR_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid ACCGATE_ASYNC_DETECTOR_TIMEOUT")?,

            journal_capacity: std::env::var("ACCGATE_JOURNAL_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .context("Invalid ACCGATE_JOURNAL_CAPACITY")?,

            stream_check_chunks: std::env::var("ACCGATE_STREAM_CHECK_CHUNKS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid ACCGATE_STREAM_CHECK_CHUNKS")?,

            stream_check_bytes: std::env::var("ACCGATE_STREAM_CHECK_BYTES")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .context("Invalid ACCGATE_STREAM_CHECK_BYTES")?,

            unary_timeout_secs: std::env::var("ACCGATE_UNARY_TIMEOUT")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .context("Invalid ACCGATE_UNARY_TIMEOUT")?,

            stream_timeout_secs: std::env::var("ACCGATE_STREAM_TIMEOUT")
                .unwrap_or_else(|_| "180".to_string())
                .parse()
                .context("Invalid ACCGATE_STREAM_TIMEOUT")?,

            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            google_api_key: std::env::var("GOOGLE_API_KEY").ok(),
            deepseek_api_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            groq_api_key: std::env::var("GROQ_API_KEY").ok(),
            mistral_api_key: std::env::var("MISTRAL_API_KEY").ok(),
            xai_api_key: std::env::var("XAI_API_KEY").ok(),
        })
    }

    /// Default pass-through key for a provider, when the client sent none.
    pub fn provider_default_key(&self, provider: &str) -> Option<&str> {
        match provider {
            "anthropic" => self.anthropic_api_key.as_deref(),
            "openai" => self.openai_api_key.as_deref(),
            "google" => self.google_api_key.as_deref(),
            "deepseek" => self.deepseek_api_key.as_deref(),
            "groq" => self.groq_api_key.as_deref(),
            "mistral" => self.mistral_api_key.as_deref(),
            "xai" => self.xai_api_key.as_deref(),
            _ => None,
        }
    }

    /// Check if at least one default provider key is configured
    pub fn has_default_provider(&self) -> bool {
        self.anthropic_api_key.is_some()
            || self.openai_api_key.is_some()
            || self.google_api_key.is_some()
            || self.deepseek_api_key.is_some()
            || self.groq_api_key.is_some()
            || self.mistral_api_key.is_some()
            || self.xai_api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_mode_parses_known_values() {
        assert_eq!(SecurityMode::parse("monitor"), SecurityMode::Monitor);
        assert_eq!(SecurityMode::parse("warn"), SecurityMode::Warn);
        assert_eq!(SecurityMode::parse("enforce"), SecurityMode::Enforce);
        assert_eq!(SecurityMode::parse("garbage"), SecurityMode::Enforce);
    }
}
