//! Confidence Aggregator
//!
//! Merges catalog matches and pattern signatures into one confidence and an
//! ordered list of recommendations. A direct catalog hit always wins; inferred
//! evidence never raises or lowers it.

use crate::config::ConfidencePolicy;
use culprit_shared::{
    DiagnosisBasis, PatternSignature, RuleMatch, RuleStatus, DIRECT_MATCH_CONFIDENCE,
};

/// Recommendation when no automation cause was found at all.
pub const NO_CAUSE_RECOMMENDATION: &str =
    "No automation-related pattern found; consider checking device firmware/connectivity.";

/// Note appended to pattern-only diagnoses.
pub const UNNAMED_AUTOMATION_NOTE: &str =
    "The responsible automation could not be identified by name; it may not be visible \
     through the platform's rule API. Review routines, scenes and automations manually in \
     the platform's own automation editor.";

/// Recommendation when the catalog rejected our credentials.
pub const REAUTHORIZE_RECOMMENDATION: &str =
    "The rule catalog could not be read with the current credentials; re-authorize to \
     include named rules in future diagnoses.";

/// Everything the aggregator looks at beyond the evidence itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationContext {
    /// Cross-device events were available to the detectors
    pub cross_device_coverage: bool,
    /// The rule catalog refused our credentials
    pub catalog_auth_error: bool,
}

/// Aggregated outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub overall_confidence: f64,
    pub basis: DiagnosisBasis,
    pub recommendations: Vec<String>,
}

/// Combine evidence into a single confidence.
///
/// * Any direct match: confidence is [`DIRECT_MATCH_CONFIDENCE`], recommendations
///   name the rules. The policy cannot lower it.
/// * Otherwise any signature: the strongest signature's confidence, with the
///   optional coverage penalty when cross-device data was missing.
/// * Otherwise zero with a no-cause recommendation.
pub fn aggregate(
    matches: &[RuleMatch],
    signatures: &[PatternSignature],
    policy: &ConfidencePolicy,
    context: AggregationContext,
) -> Aggregate {
    let direct: Vec<&RuleMatch> = matches.iter().filter(|m| m.is_direct()).collect();

    let mut result = if !direct.is_empty() {
        Aggregate {
            overall_confidence: DIRECT_MATCH_CONFIDENCE,
            basis: DiagnosisBasis::DirectMatch,
            recommendations: direct.iter().map(|m| describe_match(m)).collect(),
        }
    } else if !signatures.is_empty() {
        let strongest = signatures
            .iter()
            .map(|s| s.confidence)
            .fold(0.0_f64, f64::max);
        let confidence = if policy.penalize_missing_cross_device && !context.cross_device_coverage {
            strongest * policy.cross_device_penalty
        } else {
            strongest
        };

        let mut recommendations: Vec<String> = Vec::with_capacity(signatures.len() + 1);
        for signature in signatures {
            if !recommendations.contains(&signature.recommendation) {
                recommendations.push(signature.recommendation.clone());
            }
        }
        recommendations.push(UNNAMED_AUTOMATION_NOTE.to_string());

        Aggregate {
            overall_confidence: confidence.clamp(0.0, 1.0),
            basis: DiagnosisBasis::PatternInference,
            recommendations,
        }
    } else {
        Aggregate {
            overall_confidence: 0.0,
            basis: DiagnosisBasis::NoAutomationFound,
            recommendations: vec![NO_CAUSE_RECOMMENDATION.to_string()],
        }
    };

    if context.catalog_auth_error {
        result
            .recommendations
            .push(REAUTHORIZE_RECOMMENDATION.to_string());
    }

    result
}

fn describe_match(m: &RuleMatch) -> String {
    let mut text = format!(
        "Rule '{}' (id {}) references this device as {}.",
        m.rule_name, m.rule_id, m.role
    );
    if m.scheduled {
        text.push_str(" It runs on a schedule.");
    }
    match m.status {
        RuleStatus::Enabled => {
            if m.role.controls() {
                text.push_str(" Review or disable this rule if the device should not change.");
            } else {
                text.push_str(" Its actions may be reacting to this device.");
            }
        }
        RuleStatus::Disabled => {
            text.push_str(" The rule is currently disabled, so it is unlikely to be the cause now.")
        }
        RuleStatus::Deleted => {
            text.push_str(" The rule is marked deleted, so it is unlikely to be the cause now.")
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use culprit_shared::{MatchRole, PatternKind};

    fn fight(confidence: f64) -> PatternSignature {
        PatternSignature::new(PatternKind::AutomationFight, confidence, "two rules fight")
    }

    fn scheduled() -> PatternSignature {
        PatternSignature::new(PatternKind::ScheduledAutomation, 0.75, "runs at 22:00")
    }

    #[test]
    fn test_direct_match_dominates() {
        let matches = vec![RuleMatch::direct(
            "r1",
            "Night lights",
            MatchRole::Controlled,
            RuleStatus::Enabled,
        )];
        let result = aggregate(
            &matches,
            &[fight(0.95)],
            &ConfidencePolicy::default(),
            AggregationContext::default(),
        );
        assert_eq!(result.overall_confidence, 1.0);
        assert_eq!(result.basis, DiagnosisBasis::DirectMatch);
        assert_eq!(result.recommendations.len(), 1);
        assert!(result.recommendations[0].contains("Night lights"));
        assert!(result.recommendations[0].contains("r1"));
        assert!(result.recommendations[0].contains("controlled"));
    }

    #[test]
    fn test_patterns_take_max() {
        let result = aggregate(
            &[],
            &[scheduled(), fight(0.85)],
            &ConfidencePolicy::default(),
            AggregationContext::default(),
        );
        assert_eq!(result.overall_confidence, 0.85);
        assert_eq!(result.basis, DiagnosisBasis::PatternInference);
        assert_eq!(result.recommendations.len(), 3);
        assert_eq!(result.recommendations[2], UNNAMED_AUTOMATION_NOTE);
    }

    #[test]
    fn test_duplicate_recommendations_collapse() {
        let result = aggregate(
            &[],
            &[fight(0.95), fight(0.85)],
            &ConfidencePolicy::default(),
            AggregationContext::default(),
        );
        assert_eq!(result.recommendations.len(), 2);
    }

    #[test]
    fn test_no_evidence_is_zero() {
        let result = aggregate(
            &[],
            &[],
            &ConfidencePolicy::default(),
            AggregationContext::default(),
        );
        assert_eq!(result.overall_confidence, 0.0);
        assert_eq!(result.basis, DiagnosisBasis::NoAutomationFound);
        assert_eq!(result.recommendations, vec![NO_CAUSE_RECOMMENDATION.to_string()]);
    }

    #[test]
    fn test_coverage_penalty_only_when_enabled() {
        let context = AggregationContext::default();
        let plain = aggregate(&[], &[scheduled()], &ConfidencePolicy::default(), context);
        assert_eq!(plain.overall_confidence, 0.75);

        let policy = ConfidencePolicy {
            penalize_missing_cross_device: true,
            ..ConfidencePolicy::default()
        };
        let penalized = aggregate(&[], &[scheduled()], &policy, context);
        assert!((penalized.overall_confidence - 0.675).abs() < 1e-9);

        let covered = aggregate(
            &[],
            &[scheduled()],
            &policy,
            AggregationContext {
                cross_device_coverage: true,
                ..context
            },
        );
        assert_eq!(covered.overall_confidence, 0.75);
    }

    #[test]
    fn test_penalty_never_touches_direct_match() {
        let policy = ConfidencePolicy {
            penalize_missing_cross_device: true,
            ..ConfidencePolicy::default()
        };
        let matches = vec![RuleMatch::direct("r1", "Porch", MatchRole::Both, RuleStatus::Enabled)];
        let result = aggregate(&matches, &[], &policy, AggregationContext::default());
        assert_eq!(result.overall_confidence, 1.0);
    }

    #[test]
    fn test_direct_match_ignores_policy_weights() {
        let policy = ConfidencePolicy {
            automation_fight_high: 0.0,
            automation_fight_low: 0.0,
            scheduled_automation: 0.0,
            triggered_automation: 0.0,
            penalize_missing_cross_device: true,
            cross_device_penalty: 0.0,
        };
        let matches = vec![RuleMatch::direct("r1", "Porch", MatchRole::Controlled, RuleStatus::Enabled)];
        let result = aggregate(&matches, &[fight(0.95)], &policy, AggregationContext::default());
        assert_eq!(result.overall_confidence, DIRECT_MATCH_CONFIDENCE);
        assert_eq!(result.overall_confidence, 1.0);
    }

    #[test]
    fn test_status_and_schedule_noted() {
        let matches = vec![
            RuleMatch::direct("r1", "Old rule", MatchRole::Controlled, RuleStatus::Disabled),
            RuleMatch::direct("r2", "Timer", MatchRole::Controlled, RuleStatus::Enabled)
                .with_scheduled(true),
        ];
        let result = aggregate(
            &matches,
            &[],
            &ConfidencePolicy::default(),
            AggregationContext::default(),
        );
        assert!(result.recommendations[0].contains("disabled"));
        assert!(result.recommendations[1].contains("schedule"));
    }

    #[test]
    fn test_auth_error_adds_reauthorize() {
        let result = aggregate(
            &[],
            &[],
            &ConfidencePolicy::default(),
            AggregationContext {
                catalog_auth_error: true,
                ..AggregationContext::default()
            },
        );
        assert_eq!(result.recommendations.len(), 2);
        assert_eq!(result.recommendations[1], REAUTHORIZE_RECOMMENDATION);
    }
}
