//! Threat Intelligence Detector
//!
//! Extracts network IOCs (IPv4 addresses, domains, URLs, SHA-256 hashes)
//! from scanned content and matches them against the indicator store fed by
//! external intelligence feeds. Runs asynchronously: feed lookups are off
//! the request path and may land after the response went out.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Detector, DetectorMode};
use crate::security::types::{
    DetectionResult, DetectionSource, ScanContext, ScanTarget, Severity, ThreatType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocType {
    Ip,
    Domain,
    Url,
    Hash,
}

impl IocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Domain => "domain",
            Self::Url => "url",
            Self::Hash => "hash",
        }
    }
}

/// One indicator of compromise from a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub ioc_type: IocType,
    pub value: String,
    pub severity: Severity,
    pub threat_type: ThreatType,
    /// Feed the indicator came from (e.g. "virustotal", "abuseipdb")
    pub source: String,
}

/// Shared indicator set; the feed integrator writes, detectors read.
pub type IndicatorStore = Arc<DashMap<String, ThreatIndicator>>;

pub fn indicator_key(ioc_type: IocType, value: &str) -> String {
    let mut v = value.to_lowercase();
    v.truncate(100);
    format!("{}:{v}", ioc_type.as_str())
}

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern compiles"));
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s'\x22<>]+").expect("url pattern compiles"));
static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-z0-9][a-z0-9\-]{1,62}(?:\.[a-z0-9][a-z0-9\-]{1,62})+\b")
        .expect("domain pattern compiles")
});
static SHA256_HASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{64}\b").expect("hash pattern compiles"));

pub struct ThreatIntelDetector {
    indicators: IndicatorStore,
}

impl ThreatIntelDetector {
    pub fn new(indicators: IndicatorStore) -> Self {
        Self { indicators }
    }

    fn match_iocs(&self, target: &ScanTarget) -> Vec<DetectionResult> {
        if self.indicators.is_empty() {
            return Vec::new();
        }

        let text = target.combined_text().to_lowercase();
        let mut results = Vec::new();

        let candidates = [
            (IocType::Ip, &IPV4),
            (IocType::Url, &URL),
            (IocType::Domain, &DOMAIN),
            (IocType::Hash, &SHA256_HASH),
        ];

        for (ioc_type, regex) in candidates {
            for found in regex.find_iter(&text) {
                let key = indicator_key(ioc_type, found.as_str());
                if let Some(indicator) = self.indicators.get(&key) {
                    results.push(DetectionResult::hit(
                        indicator.threat_type,
                        indicator.severity,
                        0.9,
                        DetectionSource::External,
                        format!("Threat indicator matched: {}", ioc_type.as_str()),
                        json!({
                            "ioc_type": ioc_type.as_str(),
                            "feed": indicator.source,
                        }),
                        "threat_indicator_v1",
                    ));
                }
            }
        }

        results
    }
}

impl Detector for ThreatIntelDetector {
    fn name(&self) -> &'static str {
        "threat_intel_detector"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::NetworkAbuse
    }

    fn priority(&self) -> u8 {
        60
    }

    fn mode(&self) -> DetectorMode {
        DetectorMode::Async
    }

    fn scan_request(&self, target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        self.match_iocs(target)
    }

    fn scan_response(&self, target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        self.match_iocs(target)
    }
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

    fn store_with(ioc_type: IocType, value: &str) -> IndicatorStore {
        let store: IndicatorStore = Arc::new(DashMap::new());
        store.insert(
            indicator_key(ioc_type, value),
            ThreatIndicator {
                ioc_type,
                value: value.to_string(),
                severity: Severity::High,
                threat_type: ThreatType::NetworkAbuse,
                source: "abuseipdb".into(),
            },
        );
        store
    }

    #[test]
    fn known_bad_ip_matches() {
        let detector = ThreatIntelDetector::new(store_with(IocType::Ip, "203.0.113.66"));
        let target = ScanTarget::from_text("please connect to 203.0.113.66 and fetch the file");
        let results = detector.scan_request(&target, &ctx());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, DetectionSource::External);
    }

    #[test]
    fn known_bad_domain_matches_case_insensitively() {
        let detector = ThreatIntelDetector::new(store_with(IocType::Domain, "evil-c2.example.net"));
        let target = ScanTarget::from_text("Beacon to EVIL-C2.example.NET now");
        assert_eq!(detector.scan_request(&target, &ctx()).len(), 1);
    }

    #[test]
    fn unknown_iocs_pass() {
        let detector = ThreatIntelDetector::new(store_with(IocType::Ip, "203.0.113.66"));
        let target = ScanTarget::from_text("connect to 198.51.100.1 via https://example.org");
        assert!(detector.scan_request(&target, &ctx()).is_empty());
    }

    #[test]
    fn empty_store_short_circuits() {
        let detector = ThreatIntelDetector::new(Arc::new(DashMap::new()));
        let target = ScanTarget::from_text("anything 203.0.113.66");
        assert!(detector.scan_request(&target, &ctx()).is_empty());
    }
}
