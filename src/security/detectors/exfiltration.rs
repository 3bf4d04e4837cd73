//! Data Exfiltration / PII Detector
//!
//! Requests are scanned for PII being shipped to the provider; responses are
//! additionally checked for volume (> 100 KB) and encoded-data smuggling
//! (>= 1 KB of base64 in one place, repeated long hex runs).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use super::{Detector, DetectorMode};
use crate::security::types::{
    DetectionResult, DetectionSource, ScanContext, ScanTarget, Severity, ThreatType,
};

struct PiiPattern {
    regex: Regex,
    kind: &'static str,
    severity: Severity,
}

fn pii(p: &str, kind: &'static str, severity: Severity) -> PiiPattern {
    PiiPattern {
        regex: Regex::new(p).expect("pii pattern compiles"),
        kind,
        severity,
    }
}

static PII_PATTERNS: Lazy<Vec<PiiPattern>> = Lazy::new(|| {
    use Severity::{Critical, Low, Medium};
    vec![
        pii(r"\b\d{3}-\d{2}-\d{4}\b", "us_ssn", Critical),
        pii(r"\b\d{4}[\s\-]?\d{4}[\s\-]?\d{4}[\s\-]?\d{4}\b", "credit_card", Critical),
        pii(r"\b(?:3[47]\d{13})\b", "amex", Critical),
        pii(r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b", "email", Low),
        pii(r"\b(?:\+?1[\-.\s]?)?\(?\d{3}\)?[\-.\s]\d{3}[\-.\s]\d{4}\b", "us_phone", Medium),
        pii(
            r"\b\d+\s+[A-Za-z]+\s+(?:Street|St|Avenue|Ave|Road|Rd|Lane|Ln|Drive|Dr|Boulevard|Blvd)\b",
            "street_address",
            Medium,
        ),
        pii(r"eyJ[a-zA-Z0-9_\-]{6,}\.eyJ[a-zA-Z0-9_\-]{6,}\.[a-zA-Z0-9_\-]+", "jwt_token", Medium),
        pii(r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "ipv4", Low),
        pii(r"\b(?:[0-9A-Fa-f]{2}[:\-]){5}[0-9A-Fa-f]{2}\b", "mac_address", Low),
    ]
});

static BASE64_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{100,}={0,2}").expect("base64 run pattern compiles"));

static HEX_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:0x)?[0-9A-Fa-f]{64,}").expect("hex run pattern compiles"));

const MAX_RESPONSE_KB: usize = 100;
const ENCODED_BYTES_THRESHOLD: usize = 1000;

pub struct ExfiltrationDetector;

impl Detector for ExfiltrationDetector {
    fn name(&self) -> &'static str {
        "data_exfiltration_detector"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::DataExfiltration
    }

    fn priority(&self) -> u8 {
        15
    }

    fn mode(&self) -> DetectorMode {
        DetectorMode::Sync
    }

    fn scan_request(&self, target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        detect_pii(&target.combined_text(), "request")
    }

    fn scan_response(&self, target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        let text = target.combined_text();
        let mut results = detect_pii(&text, "response");
        results.extend(check_volume(&text));
        results.extend(check_encoded(&text));
        results
    }
}

fn detect_pii(text: &str, location: &str) -> Vec<DetectionResult> {
    let mut kinds: Vec<&'static str> = Vec::new();
    let mut total = 0usize;
    let mut worst = Severity::Low;

    for pattern in PII_PATTERNS.iter() {
        let count = pattern.regex.find_iter(text).count();
        if count == 0 {
            continue;
        }
        total += count;
        if !kinds.contains(&pattern.kind) {
            kinds.push(pattern.kind);
        }
        if pattern.severity > worst {
            worst = pattern.severity;
        }
    }

    if kinds.is_empty() {
        return Vec::new();
    }

    let confidence = (0.5 + kinds.len() as f64 * 0.1).min(0.9);
    vec![DetectionResult::hit(
        ThreatType::DataExfiltration,
        worst,
        confidence,
        DetectionSource::Signature,
        format!("PII detected in {location}"),
        json!({
            "location": location,
            "pii_types": kinds,
            "total_count": total,
        }),
        "exfil_pii_v1",
    )]
}

fn check_volume(text: &str) -> Vec<DetectionResult> {
    let size_kb = text.len() / 1024;
    if size_kb <= MAX_RESPONSE_KB {
        return Vec::new();
    }
    vec![DetectionResult::hit(
        ThreatType::DataExfiltration,
        Severity::Medium,
        0.7,
        DetectionSource::Heuristic,
        format!("Large response size detected ({size_kb} KB)"),
        json!({ "size_kb": size_kb, "threshold_kb": MAX_RESPONSE_KB }),
        "exfil_volume_v1",
    )]
}

fn check_encoded(text: &str) -> Vec<DetectionResult> {
    let mut results = Vec::new();

    let encoded_bytes: usize = BASE64_RUN.find_iter(text).map(|m| m.as_str().len()).sum();
    if encoded_bytes > ENCODED_BYTES_THRESHOLD {
        results.push(DetectionResult::hit(
            ThreatType::DataExfiltration,
            Severity::Medium,
            0.6,
            DetectionSource::Heuristic,
            "Large base64-encoded data detected",
            json!({ "total_size_bytes": encoded_bytes }),
            "exfil_encoded_v1",
        ));
    }

    let hex_runs = HEX_RUN.find_iter(text).count();
    if hex_runs > 2 {
        results.push(DetectionResult::hit(
            ThreatType::DataExfiltration,
            Severity::Low,
            0.4,
            DetectionSource::Heuristic,
            "Multiple hex-encoded strings detected",
            json!({ "count": hex_runs }),
            "exfil_hex_v1",
        ));
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ScanContext {
        ScanContext {
            user_id: Uuid::new_v4(),
            agent_id: None,
            request_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn ssn_in_request_is_critical() {
        let detector = ExfiltrationDetector;
        let target = ScanTarget::from_request(&serde_json::json!({
            "messages": [{ "role": "user", "content": "My SSN is 078-05-1120" }]
        }));
        let results = detector.scan_request(&target, &ctx());
        assert_eq!(results[0].severity, Severity::Critical);
        assert!(results[0].evidence["pii_types"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "us_ssn"));
    }

    #[test]
    fn oversized_response_is_flagged() {
        let detector = ExfiltrationDetector;
        let target = ScanTarget::from_text(&"word ".repeat(30_000));
        let results = detector.scan_response(&target, &ctx());
        assert!(results.iter().any(|r| r.rule_id == Some("exfil_volume_v1")));
    }

    #[test]
    fn kilobyte_of_base64_is_flagged() {
        let detector = ExfiltrationDetector;
        let blob: String = "ABCDefgh0123".repeat(100);
        let target = ScanTarget::from_text(&blob);
        let results = detector.scan_response(&target, &ctx());
        assert!(results.iter().any(|r| r.rule_id == Some("exfil_encoded_v1")));
    }

    #[test]
    fn short_clean_response_passes() {
        let detector = ExfiltrationDetector;
        let target = ScanTarget::from_text("The answer is forty-two.");
        assert!(detector.scan_response(&target, &ctx()).is_empty());
    }
}
