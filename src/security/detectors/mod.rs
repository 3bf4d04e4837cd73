//! Detector framework
//!
//! Every detector implements one trait and declares whether it runs
//! synchronously on the request path (bounded worker pool, must stay cheap)
//! or asynchronously off the path (own timeout, may deliver results after
//! the request completed, e.g. to kill a stream).
//!
//! Detectors must be infallible from the engine's point of view: a detector
//! that finds nothing returns an empty vec, and the engine converts panics
//! into "no detection".

pub mod anomaly;
pub mod credential;
pub mod exfiltration;
pub mod injection;
pub mod intel;
pub mod rules;
pub mod runaway;
pub mod semantic;
pub mod tool_abuse;

use super::types::{DetectionResult, ScanContext, ScanTarget, ThreatType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// Runs inline on the bounded worker pool
    Sync,
    /// Spawned off the request path with the engine's timeout
    Async,
}

impl DetectorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn threat_type(&self) -> ThreatType;
    /// Lower runs earlier when results are ordered
    fn priority(&self) -> u8 {
        50
    }
    fn mode(&self) -> DetectorMode {
        DetectorMode::Sync
    }
    fn scan_request(&self, _target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        Vec::new()
    }
    fn scan_response(&self, _target: &ScanTarget, _ctx: &ScanContext) -> Vec<DetectionResult> {
        Vec::new()
    }
}
