//! The diagnosis record returned to callers.
//!
//! A `Diagnosis` carries no behavior beyond formatting. It is built once per
//! request and handed back; callers may log, display or forward it.

use crate::budget::StageTiming;
use crate::event::TimeWindow;
use crate::pattern::PatternSignature;
use crate::rule_match::RuleMatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Independent evidence sources a diagnosis draws on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    EventHistory,
    RuleCatalog,
    CrossDeviceEvents,
}

impl std::fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventHistory => write!(f, "event_history"),
            Self::RuleCatalog => write!(f, "rule_catalog"),
            Self::CrossDeviceEvents => write!(f, "cross_device_events"),
        }
    }
}

/// Orchestrator states. `Done` and `DegradedDone` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisState {
    Idle,
    FetchingEvidence,
    Aggregating,
    Done,
    DegradedDone,
}

impl DiagnosisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiagnosisState::Done | DiagnosisState::DegradedDone)
    }
}

/// Which rung of the evidence ladder produced the confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisBasis {
    /// At least one rule in the catalog references the device
    DirectMatch,
    /// No catalog hit, but behavioral patterns fired
    PatternInference,
    NoAutomationFound,
}

/// Where the rule index answer came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndexFreshness {
    /// Served from a valid cache entry
    Cached,
    /// Rebuilt from a fresh catalog fetch
    Rebuilt,
    /// Catalog fetch failed; last known index served
    Stale { reason: String },
    /// Catalog fetch failed and no index was ever built
    Unavailable { reason: String },
}

impl IndexFreshness {
    pub fn is_failure(&self) -> bool {
        matches!(self, IndexFreshness::Stale { .. } | IndexFreshness::Unavailable { .. })
    }
}

/// A source that failed or timed out while the diagnosis still completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSource {
    pub source: EvidenceSource,
    pub reason: String,
}

/// Counts, timings and degradation flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisMetadata {
    pub rules_analyzed: usize,
    pub events_analyzed: usize,
    pub cross_device_events_analyzed: usize,
    /// Cross-device data was supplied, so cascade detection could run
    pub cross_device_coverage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_freshness: Option<IndexFreshness>,
    pub degraded: Vec<DegradedSource>,
    /// Credentials could not read the rule catalog; caller should re-authorize
    pub catalog_auth_error: bool,
    pub timings: Vec<StageTiming>,
    pub total_ms: u64,
}

impl DiagnosisMetadata {
    pub fn is_degraded(&self, source: EvidenceSource) -> bool {
        self.degraded.iter().any(|d| d.source == source)
    }
}

/// Result of one diagnosis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub diagnosis_id: Uuid,
    pub device_id: String,
    pub location_id: String,
    pub window: TimeWindow,
    pub state: DiagnosisState,
    pub basis: DiagnosisBasis,
    pub rule_matches: Vec<RuleMatch>,
    pub patterns: Vec<PatternSignature>,
    pub overall_confidence: f64,
    pub recommendations: Vec<String>,
    pub metadata: DiagnosisMetadata,
    pub generated_at: DateTime<Utc>,
}

impl Diagnosis {
    pub fn is_degraded(&self) -> bool {
        self.state == DiagnosisState::DegradedDone
    }

    /// One-line summary for logs.
    pub fn summary_line(&self) -> String {
        let cause = match (self.rule_matches.first(), self.patterns.first()) {
            (Some(m), _) => format!("rule '{}' ({})", m.rule_name, m.role),
            (None, Some(p)) => format!("pattern {}", p.kind),
            (None, None) => "no automation cause".to_string(),
        };
        format!(
            "{} device={} confidence={:.2} cause={} rules={} patterns={}{}",
            self.diagnosis_id,
            self.device_id,
            self.overall_confidence,
            cause,
            self.rule_matches.len(),
            self.patterns.len(),
            if self.is_degraded() { " [degraded]" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleStatus;
    use crate::rule_match::MatchRole;

    fn sample() -> Diagnosis {
        Diagnosis {
            diagnosis_id: Uuid::nil(),
            device_id: "D1".to_string(),
            location_id: "L1".to_string(),
            window: TimeWindow::last_hours(1),
            state: DiagnosisState::Done,
            basis: DiagnosisBasis::DirectMatch,
            rule_matches: vec![RuleMatch::direct(
                "r1",
                "Night lights",
                MatchRole::Controlled,
                RuleStatus::Enabled,
            )],
            patterns: Vec::new(),
            overall_confidence: 1.0,
            recommendations: vec!["check it".to_string()],
            metadata: DiagnosisMetadata {
                rules_analyzed: 1,
                events_analyzed: 0,
                cross_device_events_analyzed: 0,
                cross_device_coverage: false,
                index_freshness: Some(IndexFreshness::Rebuilt),
                degraded: Vec::new(),
                catalog_auth_error: false,
                timings: Vec::new(),
                total_ms: 3,
            },
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_line() {
        let line = sample().summary_line();
        assert!(line.contains("rule 'Night lights' (controlled)"));
        assert!(line.contains("confidence=1.00"));
        assert!(!line.contains("[degraded]"));
    }

    #[test]
    fn test_serializes_for_forwarding() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["state"], "done");
        assert_eq!(json["basis"], "direct_match");
        assert_eq!(json["metadata"]["index_freshness"]["kind"], "rebuilt");
    }
}
