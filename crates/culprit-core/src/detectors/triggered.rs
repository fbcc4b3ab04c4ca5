//! Cross-device trigger detection: target changes that keep following a
//! change on some other device in the same location.

use super::{ordered, DetectionInput, PatternDetector};
use crate::config::{ConfidencePolicy, DetectorConfig};
use culprit_shared::{DeviceEvent, PatternEvidence, PatternKind, PatternSignature};
use std::collections::{BTreeMap, HashSet};

/// Correlates each target change with the nearest preceding change on every
/// other device within `window_ms`. A cause event pairs with one target
/// change at most, so a device needs `min_occurrences` distinct changes that
/// were each followed by the target to yield a signature. Without
/// cross-device data the detector yields nothing.
#[derive(Debug, Clone)]
pub struct TriggeredPatternDetector {
    window_ms: i64,
    min_occurrences: usize,
    confidence: f64,
}

impl TriggeredPatternDetector {
    pub fn new(detectors: &DetectorConfig, policy: &ConfidencePolicy) -> Self {
        Self {
            window_ms: detectors.trigger_window_ms,
            min_occurrences: detectors.trigger_min_occurrences,
            confidence: policy.triggered_automation,
        }
    }
}

impl Default for TriggeredPatternDetector {
    fn default() -> Self {
        Self::new(&DetectorConfig::default(), &ConfidencePolicy::default())
    }
}

impl PatternDetector for TriggeredPatternDetector {
    fn name(&self) -> &'static str {
        "triggered_pattern"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<PatternSignature> {
        let Some(cross_device) = input.cross_device else {
            return Vec::new();
        };

        let others: Vec<&DeviceEvent> = ordered(cross_device)
            .into_iter()
            .filter(|e| e.device_id != input.device_id)
            .collect();
        if others.is_empty() {
            return Vec::new();
        }

        // source device -> (cause, effect) pairs
        let mut correlations: BTreeMap<&str, Vec<(&DeviceEvent, &DeviceEvent)>> = BTreeMap::new();
        // positions in `others` already paired with an earlier target
        let mut claimed: HashSet<usize> = HashSet::new();

        for target in ordered(input.events) {
            let earliest = target.epoch_ms - self.window_ms;
            let lo = others.partition_point(|o| o.epoch_ms < earliest);
            let hi = others.partition_point(|o| o.epoch_ms <= target.epoch_ms);

            // Nearest unclaimed preceding change per source device.
            let mut nearest: BTreeMap<&str, usize> = BTreeMap::new();
            for pos in lo..hi {
                if !claimed.contains(&pos) {
                    nearest.insert(others[pos].device_id.as_str(), pos);
                }
            }
            for (device_id, pos) in nearest {
                claimed.insert(pos);
                correlations
                    .entry(device_id)
                    .or_default()
                    .push((others[pos], target));
            }
        }

        correlations
            .into_iter()
            .filter(|(_, pairs)| pairs.len() >= self.min_occurrences)
            .map(|(device_id, pairs)| {
                let evidence = pairs
                    .iter()
                    .map(|(cause, effect)| {
                        let gap_ms = effect.epoch_ms - cause.epoch_ms;
                        PatternEvidence::new(
                            format!(
                                "{} {} -> {} preceded {} -> {} by {} ms",
                                device_id,
                                cause.attribute_key(),
                                cause.value,
                                effect.attribute_key(),
                                effect.value,
                                gap_ms
                            ),
                            vec![cause.timestamp, effect.timestamp],
                        )
                        .with_gap(gap_ms)
                        .with_related_device(device_id)
                    })
                    .collect();

                let recommendation = format!(
                    "Changes on this device followed changes on device '{}' within {:.1}s, {} \
                     times. An automation probably uses '{}' as its trigger; review rules that \
                     react to it.",
                    device_id,
                    self.window_ms as f64 / 1000.0,
                    pairs.len(),
                    device_id
                );

                PatternSignature::new(PatternKind::TriggeredAutomation, self.confidence, recommendation)
                    .with_evidence(evidence)
            })
            .collect()
    }
}
