//! Runaway Loop Detector
//!
//! Per-principal sliding windows over request timestamps and request hashes:
//! - more than 60 calls in the last minute: high
//! - more than 200 calls in the last 5 minutes: critical
//! - the same request hash 5+ times in the last 20 requests: medium
//!
//! State is keyed by `user:agent` behind a per-principal mutex; scanning one
//! principal never blocks another.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{Detector, DetectorMode};
use crate::security::types::{
    DetectionResult, DetectionSource, ScanContext, ScanTarget, Severity, ThreatType,
};

const MAX_CALLS_PER_MINUTE: usize = 60;
const MAX_CALLS_PER_5_MINUTES: usize = 200;
const SIMILAR_REQUEST_THRESHOLD: usize = 5;
const HASH_LOOKBACK: usize = 20;
const WINDOW: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Activity {
    request_times: Vec<Instant>,
    request_hashes: Vec<String>,
}

pub struct RunawayDetector {
    activity: DashMap<String, Mutex<Activity>>,
}

impl RunawayDetector {
    pub fn new() -> Self {
        Self {
            activity: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn record_n(&self, key: &str, n: usize, hash: &str) {
        let entry = self.activity.entry(key.to_string()).or_default();
        let mut activity = entry.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..n {
            activity.request_times.push(Instant::now());
            activity.request_hashes.push(hash.to_string());
        }
    }
}

impl Default for RunawayDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for RunawayDetector {
    fn name(&self) -> &'static str {
        "runaway_detector"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::RunawayLoop
    }

    fn priority(&self) -> u8 {
        20
    }

    fn mode(&self) -> DetectorMode {
        DetectorMode::Sync
    }

    fn scan_request(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        // Loops are an agent phenomenon; untagged traffic is not tracked.
        if ctx.agent_id.is_none() {
            return Vec::new();
        }

        let key = ctx.principal_key();
        let entry = self.activity.entry(key).or_default();
        let mut activity = entry.lock().unwrap_or_else(|p| p.into_inner());

        let now = Instant::now();
        activity.request_times.retain(|t| now.duration_since(*t) < WINDOW);
        let keep_from = activity.request_hashes.len().saturating_sub(100);
        activity.request_hashes.drain(..keep_from);

        activity.request_times.push(now);
        activity.request_hashes.push(hash_target(target));

        let mut results = Vec::new();
        results.extend(check_rate(&activity, now));
        results.extend(check_similarity(&activity));
        results
    }
}

/// Hash of the model plus the last three message texts, whitespace-normalized
/// and truncated, so trivial formatting differences still collide.
fn hash_target(target: &ScanTarget) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(model) = &target.model {
        parts.push(format!("model:{model}"));
    }
    for (_, text) in target.texts.iter().rev().take(3) {
        let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
        parts.push(normalized.chars().take(200).collect());
    }
    hex::encode(Sha256::digest(parts.join("|").as_bytes()))
}

fn check_rate(activity: &Activity, now: Instant) -> Vec<DetectionResult> {
    let mut results = Vec::new();

    let last_minute = activity
        .request_times
        .iter()
        .filter(|t| now.duration_since(**t) < Duration::from_secs(60))
        .count();
    if last_minute > MAX_CALLS_PER_MINUTE {
        results.push(DetectionResult::hit(
            ThreatType::RunawayLoop,
            Severity::High,
            0.9,
            DetectionSource::Behavioral,
            format!("High request rate detected: {last_minute} calls/minute"),
            json!({ "requests_per_minute": last_minute, "threshold": MAX_CALLS_PER_MINUTE }),
            "runaway_rate_v1",
        ));
    }

    let last_5_minutes = activity.request_times.len();
    if last_5_minutes > MAX_CALLS_PER_5_MINUTES {
        results.push(DetectionResult::hit(
            ThreatType::RunawayLoop,
            Severity::Critical,
            0.95,
            DetectionSource::Behavioral,
            format!("Runaway loop detected: {last_5_minutes} calls in 5 minutes"),
            json!({ "requests_5_minutes": last_5_minutes, "threshold": MAX_CALLS_PER_5_MINUTES }),
            "runaway_loop_v1",
        ));
    }

    results
}

fn check_similarity(activity: &Activity) -> Vec<DetectionResult> {
    if activity.request_hashes.len() < SIMILAR_REQUEST_THRESHOLD {
        return Vec::new();
    }

    let recent = &activity.request_hashes
        [activity.request_hashes.len().saturating_sub(HASH_LOOKBACK)..];
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for hash in recent {
        *counts.entry(hash.as_str()).or_insert(0) += 1;
    }

    for (hash, count) in counts {
        if count >= SIMILAR_REQUEST_THRESHOLD {
            return vec![DetectionResult::hit(
                ThreatType::RunawayLoop,
                Severity::Medium,
                0.8,
                DetectionSource::Behavioral,
                format!("Repeated similar requests detected: {count} times"),
                json!({
                    "repeat_count": count,
                    "threshold": SIMILAR_REQUEST_THRESHOLD,
                    "request_hash": &hash[..hash.len().min(8)],
                }),
                "runaway_repeat_v1",
            )];
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx_with_agent() -> ScanContext {
        ScanContext {
            user_id: Uuid::new_v4(),
            agent_id: Some("agent-1".to_string()),
            request_id: Uuid::new_v4(),
        }
    }

    fn target(content: &str) -> ScanTarget {
        ScanTarget::from_request(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": content }]
        }))
    }

    #[test]
    fn untagged_traffic_is_not_tracked() {
        let detector = RunawayDetector::new();
        let ctx = ScanContext {
            user_id: Uuid::new_v4(),
            agent_id: None,
            request_id: Uuid::new_v4(),
        };
        assert!(detector.scan_request(&target("hi"), &ctx).is_empty());
        assert!(detector.activity.is_empty());
    }

    #[test]
    fn burst_over_sixty_per_minute_fires() {
        let detector = RunawayDetector::new();
        let ctx = ctx_with_agent();
        detector.record_n(&ctx.principal_key(), 60, "unique");
        let results = detector.scan_request(&target("different every time"), &ctx);
        assert!(results.iter().any(|r| r.rule_id == Some("runaway_rate_v1")));
    }

    #[test]
    fn five_minute_window_escalates_to_critical() {
        let detector = RunawayDetector::new();
        let ctx = ctx_with_agent();
        detector.record_n(&ctx.principal_key(), 200, "unique");
        let results = detector.scan_request(&target("x"), &ctx);
        let loop_hit = results
            .iter()
            .find(|r| r.rule_id == Some("runaway_loop_v1"))
            .unwrap();
        assert_eq!(loop_hit.severity, Severity::Critical);
    }

    #[test]
    fn identical_requests_trigger_similarity() {
        let detector = RunawayDetector::new();
        let ctx = ctx_with_agent();
        let mut results = Vec::new();
        for _ in 0..SIMILAR_REQUEST_THRESHOLD {
            results = detector.scan_request(&target("exactly the same prompt"), &ctx);
        }
        assert!(results.iter().any(|r| r.rule_id == Some("runaway_repeat_v1")));
    }

    #[test]
    fn varied_requests_do_not_trigger_similarity() {
        let detector = RunawayDetector::new();
        let ctx = ctx_with_agent();
        let mut results = Vec::new();
        for i in 0..10 {
            results = detector.scan_request(&target(&format!("prompt number {i}")), &ctx);
        }
        assert!(results.is_empty());
    }
}
