//! Smart Router
//!
//! Applies per-user routing rules to substitute the effective model, answers
//! cheapest-model-with-capabilities queries, and walks fallback chains when
//! an upstream is declared unavailable.
//!
//! Rules are evaluated by ascending priority; the first whose condition
//! conjunction matches wins, and its analytics counters are updated.

use std::sync::Arc;

use chrono::{Timelike, Utc};
use dashmap::DashSet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pricing::PricingRegistry;
use crate::storage::Store;
use crate::tokens;

/// Conjunction of conditions; a rule matches only if every present key does.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Prefix match against the requested model id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_estimate_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_estimate_max: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Inclusive "HH:MM" window, both ends required to take effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_of_day_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_of_day_end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Lower value = evaluated first
    pub priority: i32,
    pub condition: RuleCondition,
    pub target_provider: String,
    pub target_model: String,
    pub is_active: bool,
    pub times_applied: u64,
    pub estimated_savings_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub target_provider: String,
    pub target_model: String,
    pub reason: String,
    pub original_model: String,
    pub estimated_savings_usd: Decimal,
    pub rule_id: Option<Uuid>,
}

/// Fallback substitutes per canonical model, best alternative first, all
/// within the same capability tier.
const FALLBACK_CHAINS: &[(&str, &[&str])] = &[
    ("claude-opus-4-5", &["claude-sonnet-4-5", "claude-3-5-sonnet-20241022", "claude-haiku-4-5"]),
    ("claude-sonnet-4-5", &["claude-sonnet-4", "claude-3-5-sonnet-20241022", "claude-haiku-4-5"]),
    ("claude-haiku-4-5", &["claude-3-5-haiku-20241022"]),
    ("claude-3-5-sonnet-20241022", &["claude-sonnet-4-5", "claude-haiku-4-5", "claude-3-5-haiku-20241022"]),
    ("claude-3-5-haiku-20241022", &["claude-haiku-4-5", "gpt-4o-mini"]),
    ("gpt-4o", &["gpt-4o-2024-11-20", "gpt-4o-mini", "claude-sonnet-4-5"]),
    ("gpt-4o-mini", &["claude-haiku-4-5", "gemini-2.0-flash"]),
    ("gpt-4-turbo", &["gpt-4o", "gpt-4o-mini", "claude-sonnet-4-5"]),
    ("gpt-4", &["gpt-4-turbo", "gpt-4o", "claude-opus-4-5"]),
    ("o1", &["claude-opus-4-5", "o1-mini"]),
    ("o1-mini", &["o3-mini", "deepseek-reasoner", "claude-sonnet-4-5"]),
    ("o3-mini", &["o1-mini", "deepseek-reasoner", "claude-sonnet-4-5"]),
    ("gemini-2.5-pro-preview", &["gemini-1.5-pro", "claude-sonnet-4-5", "gpt-4o"]),
    ("gemini-2.0-flash", &["gemini-1.5-flash", "gpt-4o-mini", "claude-haiku-4-5"]),
    ("gemini-1.5-pro", &["gemini-2.5-pro-preview", "claude-sonnet-4-5", "gpt-4o"]),
    ("gemini-1.5-flash", &["gemini-2.0-flash", "gpt-4o-mini", "claude-haiku-4-5"]),
    ("deepseek-chat", &["claude-haiku-4-5", "gpt-4o-mini", "gemini-2.0-flash"]),
    ("deepseek-reasoner", &["o1-mini", "o3-mini", "claude-sonnet-4-5"]),
    ("llama-3.3-70b-versatile", &["llama-3.1-8b-instant", "claude-sonnet-4-5", "gpt-4o"]),
    ("llama-3.1-8b-instant", &["claude-haiku-4-5", "gpt-4o-mini", "gemini-2.0-flash"]),
    ("mixtral-8x7b-32768", &["llama-3.3-70b-versatile", "claude-sonnet-4-5", "gpt-4o"]),
    ("mistral-large-2411", &["claude-sonnet-4-5", "gpt-4o", "mistral-small-2402"]),
    ("mistral-small-2402", &["claude-haiku-4-5", "gpt-4o-mini", "gemini-2.0-flash"]),
    ("codestral-2405", &["claude-sonnet-4-5", "gpt-4o", "mistral-small-2402"]),
];

/// Tried in order once a model's own chain is exhausted.
const GENERIC_FALLBACKS: &[&str] = &["claude-sonnet-4-5", "gpt-4o", "claude-haiku-4-5"];

/// Capability metadata used by the cheapest-suitable query.
struct ModelCaps {
    vision: bool,
    streaming: bool,
    function_calling: bool,
    context: u64,
    max_output: u64,
}

const CAPABILITIES: &[(&str, ModelCaps)] = &[
    ("claude-opus-4-5", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 16_384 }),
    ("claude-sonnet-4-5", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 16_384 }),
    ("claude-sonnet-4", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 16_384 }),
    ("claude-haiku-4-5", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 8_192 }),
    ("claude-3-5-sonnet-20241022", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 8_192 }),
    ("claude-3-5-haiku-20241022", ModelCaps { vision: true, streaming: true, function_calling: true, context: 200_000, max_output: 8_192 }),
    ("gpt-4o", ModelCaps { vision: true, streaming: true, function_calling: true, context: 128_000, max_output: 16_384 }),
    ("gpt-4o-mini", ModelCaps { vision: true, streaming: true, function_calling: true, context: 128_000, max_output: 16_384 }),
    ("gpt-4-turbo", ModelCaps { vision: true, streaming: true, function_calling: true, context: 128_000, max_output: 4_096 }),
    ("gpt-4", ModelCaps { vision: false, streaming: true, function_calling: true, context: 8_192, max_output: 4_096 }),
    ("o1", ModelCaps { vision: false, streaming: false, function_calling: false, context: 200_000, max_output: 100_000 }),
    ("o1-mini", ModelCaps { vision: false, streaming: false, function_calling: false, context: 128_000, max_output: 65_536 }),
    ("o3-mini", ModelCaps { vision: false, streaming: true, function_calling: true, context: 200_000, max_output: 100_000 }),
    ("gemini-2.5-pro-preview", ModelCaps { vision: true, streaming: true, function_calling: true, context: 1_000_000, max_output: 65_536 }),
    ("gemini-2.0-flash", ModelCaps { vision: true, streaming: true, function_calling: true, context: 1_000_000, max_output: 8_192 }),
    ("gemini-1.5-pro", ModelCaps { vision: true, streaming: true, function_calling: true, context: 2_000_000, max_output: 8_192 }),
    ("gemini-1.5-flash", ModelCaps { vision: true, streaming: true, function_calling: true, context: 1_000_000, max_output: 8_192 }),
    ("deepseek-chat", ModelCaps { vision: false, streaming: true, function_calling: true, context: 64_000, max_output: 8_192 }),
    ("deepseek-reasoner", ModelCaps { vision: false, streaming: true, function_calling: false, context: 64_000, max_output: 8_192 }),
    ("llama-3.3-70b-versatile", ModelCaps { vision: false, streaming: true, function_calling: true, context: 128_000, max_output: 8_192 }),
    ("llama-3.1-8b-instant", ModelCaps { vision: false, streaming: true, function_calling: true, context: 128_000, max_output: 8_192 }),
    ("mixtral-8x7b-32768", ModelCaps { vision: false, streaming: true, function_calling: true, context: 32_768, max_output: 4_096 }),
    ("mistral-large-2411", ModelCaps { vision: false, streaming: true, function_calling: true, context: 128_000, max_output: 8_192 }),
    ("mistral-small-2402", ModelCaps { vision: false, streaming: true, function_calling: true, context: 32_000, max_output: 8_192 }),
    ("codestral-2405", ModelCaps { vision: false, streaming: true, function_calling: true, context: 256_000, max_output: 8_192 }),
];

/// Capability requirements for the cheapest-suitable query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityFilter {
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
    pub min_context_window: Option<u64>,
    pub min_output_tokens: Option<u64>,
    pub providers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheapestPick {
    pub model: String,
    pub provider: String,
    pub input_cost_per_mtok: Decimal,
    pub output_cost_per_mtok: Decimal,
    pub avg_cost_per_mtok: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackPick {
    pub model: String,
    pub provider: Option<String>,
    pub is_fallback: bool,
    pub original_model: String,
}

pub struct SmartRouter {
    store: Arc<Store>,
    pricing: Arc<PricingRegistry>,
    /// Models currently declared unavailable upstream
    unavailable: DashSet<String>,
}

impl SmartRouter {
    pub fn new(store: Arc<Store>, pricing: Arc<PricingRegistry>) -> Self {
        Self {
            store,
            pricing,
            unavailable: DashSet::new(),
        }
    }

    /// Pick the effective (provider, model) for a request. First matching
    /// rule wins and has its counters updated; no match passes through.
    pub fn route_request(
        &self,
        user_id: Uuid,
        agent_id: Option<&str>,
        requested_model: &str,
        body: &Value,
        system: Option<&str>,
    ) -> RoutingDecision {
        self.evaluate(user_id, agent_id, requested_model, body, system, true)
    }

    /// Dry-run: same evaluation, counters untouched.
    pub fn simulate(
        &self,
        user_id: Uuid,
        requested_model: &str,
        body: &Value,
        system: Option<&str>,
    ) -> RoutingDecision {
        self.evaluate(user_id, None, requested_model, body, system, false)
    }

    fn evaluate(
        &self,
        user_id: Uuid,
        agent_id: Option<&str>,
        requested_model: &str,
        body: &Value,
        system: Option<&str>,
        record: bool,
    ) -> RoutingDecision {
        let rules = self.store.rules_for(user_id);

        let estimated_tokens = tokens::rough_total_tokens(body);
        let message_count = body
            .get("messages")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let task_type = classify_task(system, message_count);
        let now = Utc::now();
        let time_of_day = format!("{:02}:{:02}", now.hour(), now.minute());

        for rule in rules {
            if !rule_matches(
                &rule,
                agent_id,
                requested_model,
                estimated_tokens,
                task_type,
                &time_of_day,
            ) {
                continue;
            }

            let savings =
                self.estimate_savings(requested_model, &rule.target_model, estimated_tokens);

            if record {
                self.store.record_rule_application(rule.id, savings);
            }

            return RoutingDecision {
                target_provider: rule.target_provider.clone(),
                target_model: rule.target_model.clone(),
                reason: format!("Matched rule: {}", rule.name),
                original_model: requested_model.to_string(),
                estimated_savings_usd: savings,
                rule_id: Some(rule.id),
            };
        }

        let provider = self
            .pricing
            .find_by_model(requested_model)
            .map(|d| d.provider)
            .unwrap_or_else(|| crate::providers::infer_provider(requested_model).to_string());

        RoutingDecision {
            target_provider: provider,
            target_model: requested_model.to_string(),
            reason: "No routing rules matched".to_string(),
            original_model: requested_model.to_string(),
            estimated_savings_usd: Decimal::ZERO,
            rule_id: None,
        }
    }

    /// Cost difference between original and target under a 50/50
    /// input/output split of the estimated tokens. Never negative.
    fn estimate_savings(&self, original: &str, target: &str, estimated_tokens: u64) -> Decimal {
        if original == target {
            return Decimal::ZERO;
        }
        let (Some(original_price), Some(target_price)) = (
            self.pricing.find_by_model(original),
            self.pricing.find_by_model(target),
        ) else {
            return Decimal::ZERO;
        };

        let half = Decimal::from(estimated_tokens / 2);
        let mtok = Decimal::from(1_000_000u64);
        let original_cost =
            half / mtok * (original_price.input_per_mtok + original_price.output_per_mtok);
        let target_cost = half / mtok * (target_price.input_per_mtok + target_price.output_per_mtok);

        (original_cost - target_cost).max(Decimal::ZERO)
    }

    /// Cheapest model satisfying the capability filter, ranked by the mean of
    /// input and output MTok price.
    pub fn cheapest_suitable(&self, filter: &CapabilityFilter) -> Option<CheapestPick> {
        let two = Decimal::from(2u8);
        let mut best: Option<CheapestPick> = None;

        for (model, caps) in CAPABILITIES {
            if filter.supports_vision && !caps.vision {
                continue;
            }
            if filter.supports_streaming && !caps.streaming {
                continue;
            }
            if filter.supports_function_calling && !caps.function_calling {
                continue;
            }
            if filter.min_context_window.is_some_and(|min| caps.context < min) {
                continue;
            }
            if filter.min_output_tokens.is_some_and(|min| caps.max_output < min) {
                continue;
            }

            let Some(price) = self.pricing.find_by_model(model) else {
                continue;
            };
            if let Some(providers) = &filter.providers {
                if !providers.iter().any(|p| p == &price.provider) {
                    continue;
                }
            }

            let avg = (price.input_per_mtok + price.output_per_mtok) / two;
            if best.as_ref().map_or(true, |b| avg < b.avg_cost_per_mtok) {
                best = Some(CheapestPick {
                    model: (*model).to_string(),
                    provider: price.provider,
                    input_cost_per_mtok: price.input_per_mtok,
                    output_cost_per_mtok: price.output_per_mtok,
                    avg_cost_per_mtok: avg,
                });
            }
        }

        best
    }

    /// Declare a model unavailable upstream (or available again).
    pub fn mark_unavailable(&self, model: &str) {
        self.unavailable.insert(model.to_string());
    }

    pub fn mark_available(&self, model: &str) {
        self.unavailable.remove(model);
    }

    /// Best substitute when `primary` is unavailable: walk its chain, then
    /// the generic fallbacks, skipping anything known-unavailable. When
    /// everything is exhausted the original comes back with
    /// `is_fallback = false`.
    pub fn fallback_model(&self, primary: &str, also_unavailable: &[String]) -> FallbackPick {
        let is_out = |model: &str| {
            model == primary
                || self.unavailable.contains(model)
                || also_unavailable.iter().any(|m| m == model)
        };

        let chain = FALLBACK_CHAINS
            .iter()
            .find(|(m, _)| *m == primary)
            .map(|(_, chain)| *chain)
            .unwrap_or(&[]);

        for candidate in chain.iter().chain(GENERIC_FALLBACKS) {
            if is_out(candidate) {
                continue;
            }
            if let Some(price) = self.pricing.find_by_model(candidate) {
                return FallbackPick {
                    model: (*candidate).to_string(),
                    provider: Some(price.provider),
                    is_fallback: true,
                    original_model: primary.to_string(),
                };
            }
        }

        FallbackPick {
            model: primary.to_string(),
            provider: None,
            is_fallback: false,
            original_model: primary.to_string(),
        }
    }

    pub fn fallback_chain(&self, model: &str) -> Vec<&'static str> {
        FALLBACK_CHAINS
            .iter()
            .find(|(m, _)| *m == model)
            .map(|(_, chain)| chain.to_vec())
            .unwrap_or_default()
    }
}

fn rule_matches(
    rule: &RoutingRule,
    agent_id: Option<&str>,
    requested_model: &str,
    estimated_tokens: u64,
    task_type: &str,
    time_of_day: &str,
) -> bool {
    let c = &rule.condition;

    if let Some(want) = &c.agent_id {
        if agent_id != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(prefix) = &c.model_requested {
        if !requested_model.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if c.token_estimate_max.is_some_and(|max| estimated_tokens > max) {
        return false;
    }
    if c.token_estimate_min.is_some_and(|min| estimated_tokens < min) {
        return false;
    }
    if let Some(want) = &c.task_type {
        if want != task_type {
            return false;
        }
    }
    if let (Some(start), Some(end)) = (&c.time_of_day_start, &c.time_of_day_end) {
        if !(start.as_str() <= time_of_day && time_of_day <= end.as_str()) {
            return false;
        }
    }

    true
}

/// Keyword heuristic over the system prompt, falling back to conversation
/// shape.
fn classify_task(system: Option<&str>, message_count: usize) -> &'static str {
    let system = system.map(str::to_lowercase).unwrap_or_default();

    if system.contains("code") || system.contains("programming") {
        "code"
    } else if system.contains("analyze") || system.contains("analysis") {
        "analysis"
    } else if system.contains("summarize") || system.contains("summary") {
        "summarization"
    } else if system.contains("translate") {
        "translation"
    } else if message_count <= 2 {
        "simple"
    } else {
        "general"
    }
}
