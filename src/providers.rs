//! Provider Profiles
//!
//! Static table of upstream LLM providers: base URL, authentication header
//! convention, wire shape, and extra headers. The outbound credential is
//! always taken from the inbound request (pass-through) or from the
//! operator's configured default; the proxy stores no provider secrets.

use axum::http::HeaderMap;

/// The request/response shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// Anthropic Messages API (`/v1/messages`)
    Anthropic,
    /// OpenAI Chat Completions (`/v1/chat/completions`), also spoken by
    /// DeepSeek, Groq, Mistral and xAI
    OpenAi,
}

/// How the provider expects its credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `x-api-key: <key>` header (Anthropic)
    XApiKey,
    /// `Authorization: Bearer <key>` header
    Bearer,
    /// `?key=<key>` query parameter (Google)
    QueryKey,
}

/// Static profile for one upstream provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    pub name: &'static str,
    pub base_url: &'static str,
    pub auth: AuthStyle,
    pub shape: WireShape,
    /// Extra headers sent on every call, e.g. `anthropic-version`
    pub extra_headers: &'static [(&'static str, &'static str)],
}

impl ProviderProfile {
    /// Full URL of the chat endpoint for this provider's wire shape.
    pub fn chat_url(&self) -> String {
        match self.shape {
            WireShape::Anthropic => format!("{}/v1/messages", self.base_url),
            WireShape::OpenAi => format!("{}/v1/chat/completions", self.base_url),
        }
    }
}

const PROFILES: &[ProviderProfile] = &[
    ProviderProfile {
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        auth: AuthStyle::XApiKey,
        shape: WireShape::Anthropic,
        extra_headers: &[("anthropic-version", "2023-06-01")],
    },
    ProviderProfile {
        name: "openai",
        base_url: "https://api.openai.com",
        auth: AuthStyle::Bearer,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
    ProviderProfile {
        name: "google",
        base_url: "https://generativelanguage.googleapis.com",
        auth: AuthStyle::QueryKey,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
    ProviderProfile {
        name: "deepseek",
        base_url: "https://api.deepseek.com",
        auth: AuthStyle::Bearer,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
    ProviderProfile {
        name: "groq",
        base_url: "https://api.groq.com/openai",
        auth: AuthStyle::Bearer,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
    ProviderProfile {
        name: "mistral",
        base_url: "https://api.mistral.ai",
        auth: AuthStyle::Bearer,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
    ProviderProfile {
        name: "xai",
        base_url: "https://api.x.ai",
        auth: AuthStyle::Bearer,
        shape: WireShape::OpenAi,
        extra_headers: &[],
    },
];

/// Look up a provider profile by name.
pub fn profile(name: &str) -> Option<&'static ProviderProfile> {
    PROFILES.iter().find(|p| p.name == name)
}

/// Infer a provider from a model id when pricing has no answer.
///
/// Model-name prefixes are stable across providers; this mirrors how the
/// model catalog groups them.
pub fn infer_provider(model: &str) -> &'static str {
    let m = model.to_lowercase();
    if m.starts_with("claude") {
        "anthropic"
    } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") {
        "openai"
    } else if m.starts_with("gemini") {
        "google"
    } else if m.starts_with("deepseek") {
        "deepseek"
    } else if m.starts_with("llama") || m.starts_with("mixtral") {
        "groq"
    } else if m.starts_with("mistral") || m.starts_with("codestral") || m.starts_with("ministral") {
        "mistral"
    } else if m.starts_with("grok") {
        "xai"
    } else {
        "openai"
    }
}

/// Extract the pass-through upstream credential from inbound headers.
///
/// The issued `acc_` key may occupy `Authorization`; it is never forwarded
/// upstream.
pub fn passthrough_credential(shape: WireShape, headers: &HeaderMap) -> Option<String> {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    match shape {
        WireShape::Anthropic => {
            header_str("anthropic-api-key").or_else(|| header_str("x-api-key"))
        }
        WireShape::OpenAi => header_str("authorization")
            .map(|v| v.strip_prefix("Bearer ").map(str::to_string).unwrap_or(v))
            .filter(|k| !k.starts_with("acc_")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn chat_url_follows_wire_shape() {
        let anthropic = profile("anthropic").unwrap();
        assert_eq!(anthropic.chat_url(), "https://api.anthropic.com/v1/messages");

        let groq = profile("groq").unwrap();
        assert_eq!(
            groq.chat_url(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn infers_provider_from_model_prefix() {
        assert_eq!(infer_provider("claude-sonnet-4-5"), "anthropic");
        assert_eq!(infer_provider("gpt-4o-mini"), "openai");
        assert_eq!(infer_provider("o3-mini"), "openai");
        assert_eq!(infer_provider("gemini-2.0-flash"), "google");
        assert_eq!(infer_provider("deepseek-reasoner"), "deepseek");
        assert_eq!(infer_provider("grok-3"), "xai");
    }

    #[test]
    fn issued_key_is_never_treated_as_upstream_credential() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer acc_0123456789abcdef"),
        );
        assert_eq!(passthrough_credential(WireShape::OpenAi, &headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer sk-real"));
        assert_eq!(
            passthrough_credential(WireShape::OpenAi, &headers),
            Some("sk-real".to_string())
        );
    }

    #[test]
    fn anthropic_credential_comes_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-x"));
        assert_eq!(
            passthrough_credential(WireShape::Anthropic, &headers),
            Some("sk-ant-x".to_string())
        );
    }
}
