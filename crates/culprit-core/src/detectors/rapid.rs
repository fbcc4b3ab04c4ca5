//! Rapid-change detection: an attribute flipping faster than a person would.

use super::{ordered, DetectionInput, PatternDetector};
use crate::config::{ConfidencePolicy, DetectorConfig};
use culprit_shared::{DeviceEvent, PatternEvidence, PatternKind, PatternSignature};
use std::collections::{BTreeMap, HashSet};

/// One value flip under the threshold.
#[derive(Debug, Clone)]
struct Flip<'a> {
    from: &'a DeviceEvent,
    to: &'a DeviceEvent,
    gap_ms: i64,
}

/// Flags attributes whose value flips within a few seconds.
///
/// Confidence is bucketed: under `high_ms` gets the high bucket, under
/// `threshold_ms` the low one. Gaps at or above the threshold never count.
#[derive(Debug, Clone)]
pub struct RapidChangeDetector {
    threshold_ms: i64,
    high_ms: i64,
    min_events: usize,
    high_confidence: f64,
    low_confidence: f64,
}

impl RapidChangeDetector {
    pub fn new(detectors: &DetectorConfig, policy: &ConfidencePolicy) -> Self {
        Self {
            threshold_ms: detectors.rapid_change_threshold_ms,
            high_ms: detectors.rapid_change_high_ms,
            min_events: detectors.rapid_change_min_events,
            high_confidence: policy.automation_fight_high,
            low_confidence: policy.automation_fight_low,
        }
    }

    fn confidence_for(&self, min_gap_ms: i64) -> f64 {
        if min_gap_ms < self.high_ms {
            self.high_confidence
        } else {
            self.low_confidence
        }
    }
}

impl Default for RapidChangeDetector {
    fn default() -> Self {
        Self::new(&DetectorConfig::default(), &ConfidencePolicy::default())
    }
}

impl PatternDetector for RapidChangeDetector {
    fn name(&self) -> &'static str {
        "rapid_change"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<PatternSignature> {
        let mut by_attribute: BTreeMap<(&str, String), Vec<&DeviceEvent>> = BTreeMap::new();
        for event in ordered(input.events) {
            by_attribute
                .entry((event.device_id.as_str(), event.attribute_key()))
                .or_default()
                .push(event);
        }

        let mut flips: Vec<Flip<'_>> = Vec::new();
        // (group, position) of every event taking part in at least one flip
        let mut involved: HashSet<(usize, usize)> = HashSet::new();
        for (group, events) in by_attribute.values().enumerate() {
            for (i, pair) in events.windows(2).enumerate() {
                let (from, to) = (pair[0], pair[1]);
                if from.value == to.value {
                    continue;
                }
                let gap_ms = to.epoch_ms - from.epoch_ms;
                if gap_ms < self.threshold_ms {
                    flips.push(Flip { from, to, gap_ms });
                    involved.insert((group, i));
                    involved.insert((group, i + 1));
                }
            }
        }

        if flips.is_empty() || involved.len() < self.min_events {
            return Vec::new();
        }

        let min_gap_ms = flips.iter().map(|f| f.gap_ms).min().unwrap_or(self.threshold_ms);
        let attributes: Vec<String> = {
            let mut names: Vec<String> = flips.iter().map(|f| f.to.attribute.clone()).collect();
            names.sort();
            names.dedup();
            names
        };

        let evidence = flips
            .iter()
            .map(|f| {
                PatternEvidence::new(
                    format!(
                        "{} changed {} -> {} after {} ms",
                        f.to.attribute_key(),
                        f.from.value,
                        f.to.value,
                        f.gap_ms
                    ),
                    vec![f.from.timestamp, f.to.timestamp],
                )
                .with_gap(f.gap_ms)
            })
            .collect();

        let recommendation = format!(
            "'{}' flipped {} time(s) within {:.1}s (fastest {} ms). Two automations are \
             probably fighting over this device: look for one rule turning it on and another \
             turning it off, then disable one or add a condition so they cannot both fire.",
            attributes.join("', '"),
            flips.len(),
            self.threshold_ms as f64 / 1000.0,
            min_gap_ms
        );

        vec![PatternSignature::new(
            PatternKind::AutomationFight,
            self.confidence_for(min_gap_ms),
            recommendation,
        )
        .with_evidence(evidence)]
    }
}
