//! Core types for the security engine: threat taxonomy, detection results,
//! and the aggregated per-request summary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    PromptInjection,
    DataExfiltration,
    CredentialExposure,
    ToolAbuse,
    RunawayLoop,
    BehavioralAnomaly,
    NetworkAbuse,
    PiiExposure,
    Custom,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::DataExfiltration => "data_exfiltration",
            Self::CredentialExposure => "credential_exposure",
            Self::ToolAbuse => "tool_abuse",
            Self::RunawayLoop => "runaway_loop",
            Self::BehavioralAnomaly => "behavioral_anomaly",
            Self::NetworkAbuse => "network_abuse",
            Self::PiiExposure => "pii_exposure",
            Self::Custom => "custom",
        }
    }
}

/// Ordered low-to-high so `max` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Log,
    Alert,
    Warn,
    Throttle,
    Downgrade,
    Block,
    Quarantine,
    Kill,
    Redact,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Alert => "alert",
            Self::Warn => "warn",
            Self::Throttle => "throttle",
            Self::Downgrade => "downgrade",
            Self::Block => "block",
            Self::Quarantine => "quarantine",
            Self::Kill => "kill",
            Self::Redact => "redact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Signature,
    Heuristic,
    Behavioral,
    Semantic,
    External,
}

/// One finding from one detector. Every field is present; nothing is
/// duck-typed.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub detected: bool,
    pub threat_type: ThreatType,
    pub severity: Severity,
    /// In [0, 1]
    pub confidence: f64,
    pub source: DetectionSource,
    pub description: String,
    pub evidence: Value,
    pub rule_id: Option<&'static str>,
}

impl DetectionResult {
    pub fn hit(
        threat_type: ThreatType,
        severity: Severity,
        confidence: f64,
        source: DetectionSource,
        description: impl Into<String>,
        evidence: Value,
        rule_id: &'static str,
    ) -> Self {
        Self {
            detected: true,
            threat_type,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            description: description.into(),
            evidence,
            rule_id: Some(rule_id),
        }
    }
}

/// Aggregation of every detection over one request or response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionSummary {
    pub detected: bool,
    pub results: Vec<DetectionResult>,
    pub max_severity: Option<Severity>,
    pub max_confidence: f64,
    pub threat_types: BTreeSet<ThreatType>,
    pub actions: BTreeSet<ResponseAction>,
}

impl DetectionSummary {
    pub fn add_result(&mut self, result: DetectionResult) {
        if result.detected {
            self.detected = true;
            self.threat_types.insert(result.threat_type);
            if self.max_severity.map_or(true, |s| result.severity > s) {
                self.max_severity = Some(result.severity);
            }
            if result.confidence > self.max_confidence {
                self.max_confidence = result.confidence;
            }
        }
        self.results.push(result);
    }

    pub fn requires(&self, action: ResponseAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn threat_type_names(&self) -> Vec<String> {
        self.threat_types.iter().map(|t| t.as_str().to_string()).collect()
    }
}

/// Who the scanned traffic belongs to.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub user_id: Uuid,
    pub agent_id: Option<String>,
    pub request_id: Uuid,
}

impl ScanContext {
    /// Key for per-principal detector state (rate windows, baselines).
    pub fn principal_key(&self) -> String {
        match &self.agent_id {
            Some(agent) => format!("{}:{agent}", self.user_id),
            None => self.user_id.to_string(),
        }
    }
}

/// Pre-extracted view of a request or response body that detectors scan.
/// Built once per analysis so detectors never re-walk the JSON.
#[derive(Debug, Clone, Default)]
pub struct ScanTarget {
    /// (location, text) pairs: system prompt, each message, response parts
    pub texts: Vec<(String, String)>,
    pub model: Option<String>,
    /// Serialized size of the original body in bytes
    pub raw_size: usize,
    /// Tool names declared in the request's `tools` array
    pub tool_names: Vec<String>,
    /// `tool_use` invocations found in a response: (name, input)
    pub tool_uses: Vec<(String, Value)>,
    /// Response carried an error object
    pub is_error: bool,
}

impl ScanTarget {
    pub fn from_request(body: &Value) -> Self {
        let mut target = Self {
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
            raw_size: body.to_string().len(),
            ..Self::default()
        };

        if let Some(system) = body.get("system") {
            push_content(&mut target.texts, "system", system);
        }

        for (i, message) in body
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("unknown");
            if let Some(content) = message.get("content") {
                push_content(&mut target.texts, &format!("message_{i}_{role}"), content);
            }
        }

        for tool in body.get("tools").and_then(Value::as_array).into_iter().flatten() {
            // Anthropic tools carry `name`; OpenAI nests under `function`.
            let name = tool
                .get("name")
                .or_else(|| tool.pointer("/function/name"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                target.tool_names.push(name.to_string());
            }
        }

        target
    }

    pub fn from_response(body: &Value) -> Self {
        let mut target = Self {
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
            raw_size: body.to_string().len(),
            is_error: body.get("error").map_or(false, |e| !e.is_null()),
            ..Self::default()
        };

        // Anthropic shape: top-level content blocks.
        if let Some(content) = body.get("content") {
            push_content(&mut target.texts, "response", content);
            for block in content.as_array().into_iter().flatten() {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    target.tool_uses.push((name.to_string(), input));
                }
            }
        }

        // OpenAI shape: choices[].message.content.
        for (i, choice) in body
            .get("choices")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            if let Some(content) = choice.pointer("/message/content") {
                push_content(&mut target.texts, &format!("choice_{i}"), content);
            }
        }

        target
    }

    /// Buffered stream text, treated as a response fragment.
    pub fn from_text(text: &str) -> Self {
        Self {
            texts: vec![("stream_buffer".to_string(), text.to_string())],
            raw_size: text.len(),
            ..Self::default()
        }
    }

    /// Every scanned text joined; detectors that do whole-body checks use
    /// this instead of iterating.
    pub fn combined_text(&self) -> String {
        self.texts
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn push_content(texts: &mut Vec<(String, String)>, location: &str, content: &Value) {
    match content {
        Value::String(s) => texts.push((location.to_string(), s.clone())),
        Value::Array(blocks) => {
            for (j, block) in blocks.iter().enumerate() {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push((format!("{location}_part_{j}"), text.to_string()));
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(severity: Severity, confidence: f64, threat: ThreatType) -> DetectionResult {
        DetectionResult::hit(
            threat,
            severity,
            confidence,
            DetectionSource::Signature,
            "test",
            Value::Null,
            "test_v1",
        )
    }

    #[test]
    fn summary_tracks_maxima() {
        let mut summary = DetectionSummary::default();
        summary.add_result(result(Severity::Medium, 0.4, ThreatType::PromptInjection));
        summary.add_result(result(Severity::Critical, 0.9, ThreatType::CredentialExposure));
        summary.add_result(result(Severity::Low, 0.2, ThreatType::PiiExposure));

        assert!(summary.detected);
        assert_eq!(summary.max_severity, Some(Severity::Critical));
        assert_eq!(summary.max_confidence, 0.9);
        assert_eq!(summary.threat_types.len(), 3);
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn request_target_extracts_texts_and_tools() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "system": "be helpful",
            "messages": [
                { "role": "user", "content": "hello" },
                { "role": "assistant", "content": [ { "type": "text", "text": "hi there" } ] }
            ],
            "tools": [
                { "name": "bash", "input_schema": {} },
                { "function": { "name": "search" } }
            ]
        });
        let target = ScanTarget::from_request(&body);
        assert_eq!(target.texts.len(), 3);
        assert_eq!(target.tool_names, vec!["bash", "search"]);
        assert_eq!(target.model.as_deref(), Some("claude-sonnet-4-5"));
    }

    #[test]
    fn response_target_handles_both_shapes() {
        let anthropic = json!({
            "content": [
                { "type": "text", "text": "result" },
                { "type": "tool_use", "name": "bash", "input": { "command": "ls" } }
            ]
        });
        let target = ScanTarget::from_response(&anthropic);
        assert_eq!(target.texts.len(), 1);
        assert_eq!(target.tool_uses.len(), 1);

        let openai = json!({
            "choices": [ { "message": { "role": "assistant", "content": "result" } } ]
        });
        let target = ScanTarget::from_response(&openai);
        assert_eq!(target.combined_text(), "result");
    }
}
