//! Behavioral Anomaly Detector
//!
//! Per-principal sliding windows (5 minutes) over request/response sizes and
//! input/output token counts, compared by z-score once a baseline of 10
//! samples exists: z >= 4 is high, z >= 3 is medium. An error rate above 50%
//! after 10+ requests is flagged separately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;

use super::{Detector, DetectorMode};
use crate::security::types::{
    DetectionResult, DetectionSource, ScanContext, ScanTarget, Severity, ThreatType,
};
use crate::tokens;

const HIGH_Z_SCORE: f64 = 4.0;
const MEDIUM_Z_SCORE: f64 = 3.0;
const MIN_SAMPLES: usize = 10;
const WINDOW: Duration = Duration::from_secs(300);

/// Sliding window over one metric.
#[derive(Default)]
struct MetricWindow {
    samples: Vec<(Instant, f64)>,
}

impl MetricWindow {
    fn add(&mut self, value: f64) {
        let now = Instant::now();
        self.samples.retain(|(t, _)| now.duration_since(*t) < WINDOW);
        self.samples.push((now, value));
    }

    fn stats(&self) -> (f64, f64, usize) {
        let n = self.samples.len();
        if n == 0 {
            return (0.0, 0.0, 0);
        }
        let mean = self.samples.iter().map(|(_, v)| v).sum::<f64>() / n as f64;
        if n < 2 {
            return (mean, 0.0, n);
        }
        let variance = self
            .samples
            .iter()
            .map(|(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        (mean, variance.sqrt(), n)
    }

    fn z_score(&self, value: f64) -> Option<f64> {
        let (mean, stddev, n) = self.stats();
        if n < MIN_SAMPLES || stddev == 0.0 {
            return None;
        }
        Some(((value - mean) / stddev).abs())
    }
}

#[derive(Default)]
struct Baseline {
    request_sizes: MetricWindow,
    response_sizes: MetricWindow,
    input_tokens: MetricWindow,
    output_tokens: MetricWindow,
    request_count: usize,
    error_count: usize,
}

pub struct AnomalyDetector {
    baselines: DashMap<String, Mutex<Baseline>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            baselines: DashMap::new(),
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for AnomalyDetector {
    fn name(&self) -> &'static str {
        "anomaly_detector"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::BehavioralAnomaly
    }

    fn priority(&self) -> u8 {
        50
    }

    fn mode(&self) -> DetectorMode {
        DetectorMode::Sync
    }

    fn scan_request(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        if ctx.agent_id.is_none() {
            return Vec::new();
        }

        let entry = self.baselines.entry(ctx.principal_key()).or_default();
        let mut baseline = entry.lock().unwrap_or_else(|p| p.into_inner());
        baseline.request_count += 1;

        let mut results = Vec::new();

        let size = target.raw_size as f64;
        results.extend(judge(
            baseline.request_sizes.z_score(size),
            "request size",
            size,
            "anomaly_request_size_v1",
        ));
        baseline.request_sizes.add(size);

        let estimated = target
            .texts
            .iter()
            .map(|(_, t)| t.len() as u64 / 4)
            .sum::<u64>() as f64;
        results.extend(judge(
            baseline.input_tokens.z_score(estimated),
            "input tokens",
            estimated,
            "anomaly_input_tokens_v1",
        ));
        baseline.input_tokens.add(estimated);

        results
    }

    fn scan_response(&self, target: &ScanTarget, ctx: &ScanContext) -> Vec<DetectionResult> {
        if ctx.agent_id.is_none() {
            return Vec::new();
        }

        let entry = self.baselines.entry(ctx.principal_key()).or_default();
        let mut baseline = entry.lock().unwrap_or_else(|p| p.into_inner());

        let mut results = Vec::new();

        let size = target.raw_size as f64;
        results.extend(judge(
            baseline.response_sizes.z_score(size),
            "response size",
            size,
            "anomaly_response_size_v1",
        ));
        baseline.response_sizes.add(size);

        let output = tokens::estimate_output_from_chars(&target.combined_text()) as f64;
        results.extend(judge(
            baseline.output_tokens.z_score(output),
            "output tokens",
            output,
            "anomaly_output_tokens_v1",
        ));
        baseline.output_tokens.add(output);

        if target.is_error {
            baseline.error_count += 1;
        }
        if baseline.request_count > MIN_SAMPLES {
            let error_rate = baseline.error_count as f64 / baseline.request_count as f64;
            if error_rate > 0.5 {
                results.push(DetectionResult::hit(
                    ThreatType::BehavioralAnomaly,
                    Severity::Medium,
                    0.7,
                    DetectionSource::Behavioral,
                    format!("High error rate detected: {:.0}%", error_rate * 100.0),
                    json!({
                        "error_rate": error_rate,
                        "request_count": baseline.request_count,
                    }),
                    "anomaly_error_rate_v1",
                ));
            }
        }

        results
    }
}

fn judge(z: Option<f64>, metric: &str, value: f64, rule_id: &'static str) -> Vec<DetectionResult> {
    let Some(z) = z else {
        return Vec::new();
    };

    let severity = if z >= HIGH_Z_SCORE {
        Severity::High
    } else if z >= MEDIUM_Z_SCORE {
        Severity::Medium
    } else {
        return Vec::new();
    };

    vec![DetectionResult::hit(
        ThreatType::BehavioralAnomaly,
        severity,
        (0.5 + z / 10.0).min(0.9),
        DetectionSource::Behavioral,
        format!("Unusual {metric} ({value:.0}, z={z:.1})"),
        json!({ "metric": metric, "value": value, "z_score": z }),
        rule_id,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ScanContext {
        ScanContext {
            user_id: Uuid::new_v4(),
            agent_id: Some("agent-9".to_string()),
            request_id: Uuid::new_v4(),
        }
    }

    fn sized_target(chars: usize) -> ScanTarget {
        ScanTarget::from_request(&json!({
            "messages": [{ "role": "user", "content": "x".repeat(chars) }]
        }))
    }

    #[test]
    fn no_detection_before_baseline_exists() {
        let detector = AnomalyDetector::new();
        let ctx = ctx();
        for _ in 0..5 {
            assert!(detector.scan_request(&sized_target(100), &ctx).is_empty());
        }
    }

    #[test]
    fn spike_against_stable_baseline_fires() {
        let detector = AnomalyDetector::new();
        let ctx = ctx();
        // Stable baseline with slight jitter so stddev is non-zero.
        for i in 0..20 {
            detector.scan_request(&sized_target(100 + (i % 3)), &ctx);
        }
        let results = detector.scan_request(&sized_target(100_000), &ctx);
        assert!(results.iter().any(|r| r.severity == Severity::High));
    }

    #[test]
    fn constant_traffic_never_fires() {
        let detector = AnomalyDetector::new();
        let ctx = ctx();
        for _ in 0..30 {
            // Zero stddev: z-score is undefined, not infinite.
            assert!(detector.scan_request(&sized_target(100), &ctx).is_empty());
        }
    }

    #[test]
    fn error_rate_over_half_fires() {
        let detector = AnomalyDetector::new();
        let ctx = ctx();
        for _ in 0..12 {
            detector.scan_request(&sized_target(50), &ctx);
        }
        let error_target = ScanTarget {
            is_error: true,
            ..ScanTarget::from_text("err")
        };
        let mut results = Vec::new();
        for _ in 0..8 {
            results = detector.scan_response(&error_target, &ctx);
        }
        assert!(results.iter().any(|r| r.rule_id == Some("anomaly_error_rate_v1")));
    }

    #[test]
    fn window_statistics() {
        let mut window = MetricWindow::default();
        for v in [10.0, 12.0, 11.0, 9.0, 10.0, 11.0, 10.0, 12.0, 9.0, 10.0] {
            window.add(v);
        }
        let (mean, stddev, n) = window.stats();
        assert_eq!(n, 10);
        assert!((mean - 10.4).abs() < 1e-9);
        assert!(stddev > 0.0);
        assert!(window.z_score(10.0).unwrap() < 1.0);
        assert!(window.z_score(100.0).unwrap() > 4.0);
    }
}
