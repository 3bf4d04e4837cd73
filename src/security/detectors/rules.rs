//! Custom Rule Detector
//!
//! Tenant-scoped rules evaluated alongside the built-in detectors. Two
//! kinds: regex patterns over the scanned text, and numeric thresholds over
//! simple request metrics. Compiled patterns are cached by rule id.

use std::sync::Arc;

use dashmap::DashMap;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{Detector, DetectorMode};
use crate::security::types::{
    DetectionResult, DetectionSource, ScanContext, ScanTarget, Severity, ThreatType,
};
use crate::storage::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomRuleKind {
    /// Case-insensitive regex over all scanned text
    Pattern { pattern: String },
    /// Numeric ceiling over one request metric
    Threshold { metric: ThresholdMetric, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    RequestBytes,
    MessageCount,
    TextBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: CustomRuleKind,
    pub severity: Severity,
    pub enabled: bool,
}

pub struct CustomRuleDetector {
    store: Arc<Store>,
    compiled: DashMap<Uuid, regex::Regex>,
}

impl CustomRuleDetector {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            compiled: DashMap::new(),
        }
    }

    fn evaluate(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        let mut results = Vec::new();

        for rule in self.store.custom_rules_for(ctx.user_id) {
            if !rule.enabled {
                continue;
            }

            let matched = match &rule.kind {
                CustomRuleKind::Pattern { pattern } => {
                    if !self.compiled.contains_key(&rule.id) {
                        match RegexBuilder::new(pattern).case_insensitive(true).build() {
                            Ok(regex) => {
                                self.compiled.insert(rule.id, regex);
                            }
                            Err(e) => {
                                // A broken tenant pattern never fails the scan.
                                tracing::warn!(rule = %rule.name, error = %e, "invalid custom rule pattern");
                            }
                        }
                    }
                    self.compiled
                        .get(&rule.id)
                        .map_or(false, |regex| regex.is_match(&target.combined_text()))
                }
                CustomRuleKind::Threshold { metric, max } => {
                    let value = match metric {
                        ThresholdMetric::RequestBytes => target.raw_size as u64,
                        ThresholdMetric::MessageCount => target.texts.len() as u64,
                        ThresholdMetric::TextBytes => {
                            target.texts.iter().map(|(_, t)| t.len() as u64).sum()
                        }
                    };
                    value > *max
                }
            };

            if matched {
                results.push(DetectionResult::hit(
                    ThreatType::Custom,
                    rule.severity,
                    0.8,
                    DetectionSource::Heuristic,
                    format!("Custom rule matched: {}", rule.name),
                    json!({ "rule_name": rule.name, "rule_uuid": rule.id }),
                    "custom_rule_v1",
                ));
            }
        }

        results
    }
}

impl Detector for CustomRuleDetector {
    fn name(&self) -> &'static str {
        "custom_rule_detector"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::Custom
    }

    fn priority(&self) -> u8 {
        40
    }

    fn mode(&self) -> DetectorMode {
        DetectorMode::Sync
    }

    fn scan_request(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        self.evaluate(target, ctx)
    }

    fn scan_response(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        self.evaluate(target, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(rule_kind: CustomRuleKind, user_id: Uuid) -> CustomRuleDetector {
        let store = Arc::new(Store::new());
        store.put_custom_rule(CustomRule {
            id: Uuid::new_v4(),
            user_id,
            name: "tenant rule".into(),
            kind: rule_kind,
            severity: Severity::High,
            enabled: true,
        });
        CustomRuleDetector::new(store)
    }

    fn ctx(user_id: Uuid) -> ScanContext {
        ScanContext {
            user_id,
            agent_id: None,
            request_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn pattern_rule_matches_case_insensitively() {
        let user = Uuid::new_v4();
        let detector = setup(
            CustomRuleKind::Pattern {
                pattern: "forbidden phrase".into(),
            },
            user,
        );
        let target = ScanTarget::from_request(&json!({
            "messages": [{ "role": "user", "content": "This contains the FORBIDDEN PHRASE here" }]
        }));
        let results = detector.scan_request(&target, &ctx(user));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::High);
    }

    #[test]
    fn threshold_rule_gates_request_size() {
        let user = Uuid::new_v4();
        let detector = setup(
            CustomRuleKind::Threshold {
                metric: ThresholdMetric::TextBytes,
                max: 100,
            },
            user,
        );
        let small = ScanTarget::from_text("short");
        assert!(detector.scan_request(&small, &ctx(user)).is_empty());

        let large = ScanTarget::from_text(&"x".repeat(200));
        assert_eq!(detector.scan_request(&large, &ctx(user)).len(), 1);
    }

    #[test]
    fn rules_are_tenant_scoped() {
        let owner = Uuid::new_v4();
        let detector = setup(
            CustomRuleKind::Pattern {
                pattern: "secret".into(),
            },
            owner,
        );
        let target = ScanTarget::from_text("the secret word");
        // A different tenant never sees the rule.
        assert!(detector.scan_request(&target, &ctx(Uuid::new_v4())).is_empty());
        assert_eq!(detector.scan_request(&target, &ctx(owner)).len(), 1);
    }

    #[test]
    fn invalid_pattern_is_ignored() {
        let user = Uuid::new_v4();
        let detector = setup(
            CustomRuleKind::Pattern {
                pattern: "(unclosed".into(),
            },
            user,
        );
        let target = ScanTarget::from_text("anything");
        assert!(detector.scan_request(&target, &ctx(user)).is_empty());
    }
}
