//! Pricing Registry
//!
//! Single source of truth for (provider, model) -> USD-per-MTok prices.
//!
//! Lookup order:
//! 1. Runtime override records (price updates land here under a write lock),
//!    newest effective record whose window contains the query time
//! 2. The compiled-in fallback table, exact key
//! 3. Prefix fallback on the first three hyphen-joined segments of the model
//!    id, then the first two (versioned ids like `claude-sonnet-4-5-20250929`
//!    resolve to their family price)
//! 4. A synthetic default of $1.00 / $2.00 per MTok
//!
//! Reads vastly outnumber writes, so overrides sit behind a reader-writer
//! lock and the fallback table is immutable.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Pricing record for one (provider, model) in one effective window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model: String,
    /// USD per million input tokens
    pub input_per_mtok: Decimal,
    /// USD per million output tokens
    pub output_per_mtok: Decimal,
    /// USD per million prompt-cache creation tokens (zero when unsupported)
    pub cache_create_per_mtok: Decimal,
    /// USD per million prompt-cache read tokens (zero when unsupported)
    pub cache_read_per_mtok: Decimal,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    /// True when no record matched and the synthetic default was used
    #[serde(default)]
    pub synthetic: bool,
}

impl ModelDescriptor {
    fn effective_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |to| at <= to)
    }
}

/// Compiled-in price: provider, model, input, output, cache-create,
/// cache-read — all USD per MTok.
struct FallbackEntry(
    &'static str,
    &'static str,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
);

const Z: Decimal = Decimal::ZERO;

#[rustfmt::skip]
static FALLBACK: &[FallbackEntry] = &[
    // Anthropic
    FallbackEntry("anthropic", "claude-opus-4-5", dec!(15.00), dec!(75.00), dec!(18.75), dec!(1.50)),
    FallbackEntry("anthropic", "claude-opus-4", dec!(15.00), dec!(75.00), dec!(18.75), dec!(1.50)),
    FallbackEntry("anthropic", "claude-sonnet-4-5", dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30)),
    FallbackEntry("anthropic", "claude-sonnet-4", dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30)),
    FallbackEntry("anthropic", "claude-haiku-4-5", dec!(0.80), dec!(4.00), dec!(1.00), dec!(0.08)),
    FallbackEntry("anthropic", "claude-3-5-sonnet-20241022", dec!(3.00), dec!(15.00), dec!(3.75), dec!(0.30)),
    FallbackEntry("anthropic", "claude-3-5-haiku-20241022", dec!(0.80), dec!(4.00), dec!(1.00), dec!(0.08)),
    FallbackEntry("anthropic", "claude-3-opus-20240229", dec!(15.00), dec!(75.00), Z, Z),
    FallbackEntry("anthropic", "claude-3-haiku-20240307", dec!(0.25), dec!(1.25), Z, Z),
    // OpenAI
    FallbackEntry("openai", "gpt-4o", dec!(2.50), dec!(10.00), Z, Z),
    FallbackEntry("openai", "gpt-4o-2024-11-20", dec!(2.50), dec!(10.00), Z, Z),
    FallbackEntry("openai", "gpt-4o-mini", dec!(0.15), dec!(0.60), Z, Z),
    FallbackEntry("openai", "gpt-4-turbo", dec!(10.00), dec!(30.00), Z, Z),
    FallbackEntry("openai", "gpt-4", dec!(30.00), dec!(60.00), Z, Z),
    FallbackEntry("openai", "gpt-3.5-turbo", dec!(0.50), dec!(1.50), Z, Z),
    FallbackEntry("openai", "o1", dec!(15.00), dec!(60.00), Z, Z),
    FallbackEntry("openai", "o1-mini", dec!(3.00), dec!(12.00), Z, Z),
    FallbackEntry("openai", "o3-mini", dec!(1.10), dec!(4.40), Z, Z),
    // Google
    FallbackEntry("google", "gemini-2.5-pro-preview", dec!(1.25), dec!(10.00), dec!(2.50), dec!(0.31)),
    FallbackEntry("google", "gemini-2.0-flash", dec!(0.10), dec!(0.40), Z, Z),
    FallbackEntry("google", "gemini-1.5-pro", dec!(1.25), dec!(5.00), dec!(2.50), dec!(0.31)),
    FallbackEntry("google", "gemini-1.5-flash", dec!(0.075), dec!(0.30), Z, Z),
    // DeepSeek
    FallbackEntry("deepseek", "deepseek-chat", dec!(0.27), dec!(1.10), dec!(0.135), dec!(0.027)),
    FallbackEntry("deepseek", "deepseek-reasoner", dec!(0.55), dec!(2.19), dec!(0.14), dec!(0.014)),
    // Groq
    FallbackEntry("groq", "llama-3.3-70b-versatile", dec!(0.59), dec!(0.79), Z, Z),
    FallbackEntry("groq", "llama-3.1-8b-instant", dec!(0.05), dec!(0.08), Z, Z),
    FallbackEntry("groq", "mixtral-8x7b-32768", dec!(0.24), dec!(0.24), Z, Z),
    // Mistral
    FallbackEntry("mistral", "mistral-large-2411", dec!(2.00), dec!(6.00), Z, Z),
    FallbackEntry("mistral", "mistral-small-2402", dec!(0.20), dec!(0.60), Z, Z),
    FallbackEntry("mistral", "codestral-2405", dec!(0.20), dec!(0.60), Z, Z),
    // xAI
    FallbackEntry("xai", "grok-3", dec!(5.00), dec!(15.00), Z, Z),
    FallbackEntry("xai", "grok-3-mini", dec!(0.30), dec!(0.90), Z, Z),
    FallbackEntry("xai", "grok-2-1212", dec!(2.00), dec!(10.00), Z, Z),
];

/// Synthetic default when no record matches.
const DEFAULT_INPUT_PER_MTOK: Decimal = dec!(1.0);
const DEFAULT_OUTPUT_PER_MTOK: Decimal = dec!(2.0);

/// Concurrent-read pricing registry with infrequent exclusive-write updates.
pub struct PricingRegistry {
    overrides: RwLock<HashMap<(String, String), Vec<ModelDescriptor>>>,
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Install or update a price record. Takes the exclusive write lock;
    /// callers are infrequent (admin updates, catalog refresh).
    pub fn upsert(&self, descriptor: ModelDescriptor) {
        let key = (descriptor.provider.clone(), descriptor.model.clone());
        let mut overrides = self
            .overrides
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.entry(key).or_default().push(descriptor);
    }

    /// Resolve effective pricing for (provider, model) at a point in time.
    ///
    /// Always returns a descriptor; `synthetic` is set when nothing matched.
    pub fn lookup(&self, provider: &str, model: &str, at: DateTime<Utc>) -> ModelDescriptor {
        {
            let overrides = self
                .overrides
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(records) = overrides.get(&(provider.to_string(), model.to_string())) {
                let mut effective: Vec<&ModelDescriptor> =
                    records.iter().filter(|r| r.effective_at(at)).collect();
                effective.sort_by_key(|r| r.effective_from);
                if let Some(latest) = effective.last() {
                    return (*latest).clone();
                }
            }
        }

        if let Some(found) = fallback_lookup(provider, model) {
            return descriptor_from(found, model);
        }

        ModelDescriptor {
            provider: provider.to_string(),
            model: model.to_string(),
            input_per_mtok: DEFAULT_INPUT_PER_MTOK,
            output_per_mtok: DEFAULT_OUTPUT_PER_MTOK,
            cache_create_per_mtok: Decimal::ZERO,
            cache_read_per_mtok: Decimal::ZERO,
            effective_from: at,
            effective_to: None,
            synthetic: true,
        }
    }

    /// Find pricing for a model without knowing the provider. Used by the
    /// router for savings estimates and fallback ranking.
    pub fn find_by_model(&self, model: &str) -> Option<ModelDescriptor> {
        let exact = FALLBACK.iter().find(|e| e.1 == model);
        let found = exact.or_else(|| {
            let family = prefix_segments(model, 3);
            FALLBACK.iter().find(|e| e.1 == family)
        })?;
        Some(descriptor_from(found, model))
    }

    /// All models the compiled-in table knows for a provider.
    pub fn models_for_provider(&self, provider: &str) -> Vec<&'static str> {
        FALLBACK
            .iter()
            .filter(|e| e.0 == provider)
            .map(|e| e.1)
            .collect()
    }

    /// Every compiled-in (provider, model) pair with its pricing.
    pub fn all_models(&self) -> Vec<ModelDescriptor> {
        FALLBACK.iter().map(|e| descriptor_from(e, e.1)).collect()
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled-in table lookup with prefix fallback: exact, then the first
/// three hyphen segments, then the first two.
fn fallback_lookup(provider: &str, model: &str) -> Option<&'static FallbackEntry> {
    let exact = FALLBACK.iter().find(|e| e.0 == provider && e.1 == model);
    exact
        .or_else(|| {
            let p3 = prefix_segments(model, 3);
            FALLBACK.iter().find(|e| e.0 == provider && e.1 == p3)
        })
        .or_else(|| {
            let p2 = prefix_segments(model, 2);
            FALLBACK.iter().find(|e| e.0 == provider && e.1 == p2)
        })
}

fn descriptor_from(entry: &FallbackEntry, model: &str) -> ModelDescriptor {
    ModelDescriptor {
        provider: entry.0.to_string(),
        model: model.to_string(),
        input_per_mtok: entry.2,
        output_per_mtok: entry.3,
        cache_create_per_mtok: entry.4,
        cache_read_per_mtok: entry.5,
        effective_from: DateTime::<Utc>::MIN_UTC,
        effective_to: None,
        synthetic: false,
    }
}

/// First `n` hyphen-joined segments of a model id.
fn prefix_segments(model: &str, n: usize) -> String {
    model.split('-').take(n).collect::<Vec<_>>().join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn exact_lookup_hits_fallback_table() {
        let registry = PricingRegistry::new();
        let d = registry.lookup("anthropic", "claude-sonnet-4-5", Utc::now());
        assert_eq!(d.input_per_mtok, dec!(3.00));
        assert_eq!(d.output_per_mtok, dec!(15.00));
        assert!(!d.synthetic);
    }

    #[test]
    fn versioned_model_resolves_by_prefix() {
        let registry = PricingRegistry::new();
        // Four segments; resolves via the three-segment prefix claude-sonnet-4.
        let d = registry.lookup("anthropic", "claude-sonnet-4-20250514", Utc::now());
        assert_eq!(d.input_per_mtok, dec!(3.00));
        assert!(!d.synthetic);
    }

    #[test]
    fn two_segment_prefix_is_the_last_resort_before_default() {
        let registry = PricingRegistry::new();
        // "gpt-4o-ultra-preview" has no exact or three-segment entry;
        // "gpt-4o" matches on two segments... via three-segment "gpt-4o-ultra"
        // failing first.
        let d = registry.lookup("openai", "gpt-4o-ultra-preview", Utc::now());
        assert_eq!(d.input_per_mtok, dec!(2.50));
        assert!(!d.synthetic);
    }

    #[test]
    fn unknown_model_gets_synthetic_default() {
        let registry = PricingRegistry::new();
        let d = registry.lookup("anthropic", "claude-nonexistent-99", Utc::now());
        assert!(d.synthetic);
        assert_eq!(d.input_per_mtok, dec!(1.0));
        assert_eq!(d.output_per_mtok, dec!(2.0));
    }

    #[test]
    fn override_wins_within_effective_window() {
        let registry = PricingRegistry::new();
        let now = Utc::now();
        registry.upsert(ModelDescriptor {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            input_per_mtok: dec!(2.00),
            output_per_mtok: dec!(8.00),
            cache_create_per_mtok: Decimal::ZERO,
            cache_read_per_mtok: Decimal::ZERO,
            effective_from: now - Duration::days(1),
            effective_to: None,
            synthetic: false,
        });

        let d = registry.lookup("openai", "gpt-4o", now);
        assert_eq!(d.input_per_mtok, dec!(2.00));

        // Outside the window the fallback price applies.
        let before = registry.lookup("openai", "gpt-4o", now - Duration::days(2));
        assert_eq!(before.input_per_mtok, dec!(2.50));
    }

    #[test]
    fn most_recent_effective_record_wins() {
        let registry = PricingRegistry::new();
        let now = Utc::now();
        for (days_ago, input) in [(10, dec!(5.00)), (2, dec!(4.00))] {
            registry.upsert(ModelDescriptor {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                input_per_mtok: input,
                output_per_mtok: dec!(10.00),
                cache_create_per_mtok: Decimal::ZERO,
                cache_read_per_mtok: Decimal::ZERO,
                effective_from: now - Duration::days(days_ago),
                effective_to: None,
                synthetic: false,
            });
        }
        assert_eq!(registry.lookup("openai", "gpt-4o", now).input_per_mtok, dec!(4.00));
    }

    #[test]
    fn repeated_reads_are_idempotent() {
        let registry = PricingRegistry::new();
        let at = Utc::now();
        let a = registry.lookup("deepseek", "deepseek-chat", at);
        let b = registry.lookup("deepseek", "deepseek-chat", at);
        assert_eq!(a.input_per_mtok, b.input_per_mtok);
        assert_eq!(a.cache_read_per_mtok, b.cache_read_per_mtok);
    }

    #[test]
    fn find_by_model_scans_all_providers() {
        let registry = PricingRegistry::new();
        let d = registry.find_by_model("deepseek-reasoner").unwrap();
        assert_eq!(d.provider, "deepseek");
        assert!(registry.find_by_model("no-such-model-anywhere").is_none());
    }
}
