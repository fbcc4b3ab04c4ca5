//! Derived facts linking a device to the rules that reference it.

use crate::rule::RuleStatus;
use serde::{Deserialize, Serialize};

/// Confidence assigned to matches read straight from the rule catalog.
pub const DIRECT_MATCH_CONFIDENCE: f64 = 1.0;

/// How a rule references a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRole {
    /// The device's attributes are read by a condition
    Trigger,
    /// The device receives commands
    Controlled,
    Both,
}

impl MatchRole {
    /// Combine two observations of the same device within one rule.
    pub fn merge(self, other: MatchRole) -> MatchRole {
        if self == other {
            self
        } else {
            MatchRole::Both
        }
    }

    pub fn controls(&self) -> bool {
        matches!(self, MatchRole::Controlled | MatchRole::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRole::Trigger => "trigger",
            MatchRole::Controlled => "controlled",
            MatchRole::Both => "trigger and controlled",
        }
    }
}

impl std::fmt::Display for MatchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rule that references a given device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub role: MatchRole,
    pub confidence: f64,
    pub status: RuleStatus,
    /// The device is controlled from inside a scheduled node
    #[serde(default)]
    pub scheduled: bool,
}

impl RuleMatch {
    pub fn direct(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        role: MatchRole,
        status: RuleStatus,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            role,
            confidence: DIRECT_MATCH_CONFIDENCE,
            status,
            scheduled: false,
        }
    }

    pub fn with_scheduled(mut self, scheduled: bool) -> Self {
        self.scheduled = scheduled;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.confidence >= DIRECT_MATCH_CONFIDENCE
    }
}

/// Order matches: controllers first, active rules first, then by name.
pub fn sort_matches(matches: &mut [RuleMatch]) {
    matches.sort_by(|a, b| {
        b.role
            .controls()
            .cmp(&a.role.controls())
            .then_with(|| b.status.is_active().cmp(&a.status.is_active()))
            .then_with(|| a.rule_name.cmp(&b.rule_name))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_merge() {
        assert_eq!(MatchRole::Trigger.merge(MatchRole::Trigger), MatchRole::Trigger);
        assert_eq!(MatchRole::Trigger.merge(MatchRole::Controlled), MatchRole::Both);
        assert_eq!(MatchRole::Both.merge(MatchRole::Controlled), MatchRole::Both);
    }

    #[test]
    fn test_sort_matches() {
        let mut matches = vec![
            RuleMatch::direct("r3", "Alpha", MatchRole::Trigger, RuleStatus::Enabled),
            RuleMatch::direct("r2", "Beta", MatchRole::Controlled, RuleStatus::Disabled),
            RuleMatch::direct("r1", "Gamma", MatchRole::Both, RuleStatus::Enabled),
        ];
        sort_matches(&mut matches);
        let ids: Vec<&str> = matches.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }
}
