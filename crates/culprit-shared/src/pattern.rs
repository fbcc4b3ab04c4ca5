//! Behavioral pattern signatures inferred from a device's event history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named behavioral pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Value flips back and forth faster than a person would toggle it
    AutomationFight,
    /// Same change at the same time of day on several days
    ScheduledAutomation,
    /// Change follows a change on another device, repeatedly
    TriggeredAutomation,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::AutomationFight => "automation_fight",
            PatternKind::ScheduledAutomation => "scheduled_automation",
            PatternKind::TriggeredAutomation => "triggered_automation",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PatternKind::AutomationFight => "Rapid toggle",
            PatternKind::ScheduledAutomation => "Scheduled re-assertion",
            PatternKind::TriggeredAutomation => "Cross-device cascade",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One piece of supporting evidence for a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvidence {
    pub description: String,
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_device: Option<String>,
}

impl PatternEvidence {
    pub fn new(description: impl Into<String>, timestamps: Vec<DateTime<Utc>>) -> Self {
        Self {
            description: description.into(),
            timestamps,
            gap_ms: None,
            related_device: None,
        }
    }

    pub fn with_gap(mut self, gap_ms: i64) -> Self {
        self.gap_ms = Some(gap_ms);
        self
    }

    pub fn with_related_device(mut self, device_id: impl Into<String>) -> Self {
        self.related_device = Some(device_id.into());
        self
    }
}

/// A detected pattern with its confidence and a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignature {
    pub kind: PatternKind,
    pub confidence: f64,
    pub evidence: Vec<PatternEvidence>,
    pub recommendation: String,
}

impl PatternSignature {
    pub fn new(kind: PatternKind, confidence: f64, recommendation: impl Into<String>) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
            recommendation: recommendation.into(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<PatternEvidence>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Order signatures by confidence, strongest first; ties keep kind order.
pub fn sort_signatures(signatures: &mut [PatternSignature]) {
    signatures.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamped() {
        let sig = PatternSignature::new(PatternKind::AutomationFight, 1.7, "x");
        assert_eq!(sig.confidence, 1.0);
    }

    #[test]
    fn test_sort_signatures() {
        let mut sigs = vec![
            PatternSignature::new(PatternKind::TriggeredAutomation, 0.70, "t"),
            PatternSignature::new(PatternKind::AutomationFight, 0.95, "f"),
            PatternSignature::new(PatternKind::ScheduledAutomation, 0.75, "s"),
        ];
        sort_signatures(&mut sigs);
        assert_eq!(sigs[0].kind, PatternKind::AutomationFight);
        assert_eq!(sigs[2].kind, PatternKind::TriggeredAutomation);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&PatternKind::ScheduledAutomation).unwrap();
        assert_eq!(json, "\"scheduled_automation\"");
    }
}
