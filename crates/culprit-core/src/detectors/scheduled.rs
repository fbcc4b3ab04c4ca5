//! Scheduled-recurrence detection: the same change at the same time of day
//! on several calendar days.

use super::{ordered, DetectionInput, PatternDetector};
use crate::config::{ConfidencePolicy, DetectorConfig};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use culprit_shared::{PatternEvidence, PatternKind, PatternSignature};
use std::collections::BTreeMap;

/// Groups changes into time-of-day buckets and flags buckets that recur on
/// at least `min_days` distinct days.
#[derive(Debug, Clone)]
pub struct ScheduledPatternDetector {
    bucket_minutes: u32,
    min_days: usize,
    offset: FixedOffset,
    confidence: f64,
}

impl ScheduledPatternDetector {
    pub fn new(detectors: &DetectorConfig, policy: &ConfidencePolicy) -> Self {
        let offset = FixedOffset::east_opt(detectors.schedule_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self {
            bucket_minutes: detectors.schedule_bucket_minutes.max(1),
            min_days: detectors.schedule_min_days,
            offset,
            confidence: policy.scheduled_automation,
        }
    }

    fn bucket_label(&self, bucket: u32) -> String {
        let start = bucket * self.bucket_minutes;
        format!("{:02}:{:02}", start / 60, start % 60)
    }
}

impl Default for ScheduledPatternDetector {
    fn default() -> Self {
        Self::new(&DetectorConfig::default(), &ConfidencePolicy::default())
    }
}

/// (attribute key, value, bucket)
type Slot = (String, String, u32);

impl PatternDetector for ScheduledPatternDetector {
    fn name(&self) -> &'static str {
        "scheduled_pattern"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<PatternSignature> {
        let mut slots: BTreeMap<Slot, BTreeMap<NaiveDate, Vec<DateTime<Utc>>>> = BTreeMap::new();

        for event in ordered(input.events) {
            let local = event.timestamp.with_timezone(&self.offset);
            let minute_of_day = local.hour() * 60 + local.minute();
            let slot = (
                event.attribute_key(),
                event.value.clone(),
                minute_of_day / self.bucket_minutes,
            );
            slots
                .entry(slot)
                .or_default()
                .entry(local.date_naive())
                .or_default()
                .push(event.timestamp);
        }

        slots
            .into_iter()
            .filter(|(_, days)| days.len() >= self.min_days)
            .map(|((attribute, value, bucket), days)| {
                let label = self.bucket_label(bucket);
                let evidence = days
                    .iter()
                    .map(|(date, timestamps)| {
                        PatternEvidence::new(
                            format!("{} -> {} around {} on {}", attribute, value, label, date),
                            timestamps.clone(),
                        )
                    })
                    .collect();

                let recommendation = format!(
                    "'{}' changes to '{}' around {} on {} different days. This looks like a \
                     scheduled automation or routine; review rules, scenes and routines that \
                     run at that time.",
                    attribute,
                    value,
                    label,
                    days.len()
                );

                PatternSignature::new(PatternKind::ScheduledAutomation, self.confidence, recommendation)
                    .with_evidence(evidence)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use culprit_shared::DeviceEvent;

    fn off_at(day: u32, hour: u32, minute: u32) -> DeviceEvent {
        DeviceEvent::at(
            "D1",
            "switch",
            "switch",
            "off",
            Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap(),
        )
    }

    fn detect(events: &[DeviceEvent]) -> Vec<PatternSignature> {
        ScheduledPatternDetector::default().detect(&DetectionInput::new("D1", events))
    }

    #[test]
    fn test_recurring_change_three_days() {
        let signatures = detect(&[off_at(1, 22, 0), off_at(2, 22, 0), off_at(3, 22, 1)]);
        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].kind, PatternKind::ScheduledAutomation);
        assert_eq!(signatures[0].confidence, 0.75);
        assert_eq!(signatures[0].evidence.len(), 3);
        assert!(signatures[0].recommendation.contains("22:00"));
    }

    #[test]
    fn test_same_day_does_not_recur() {
        assert!(detect(&[off_at(1, 22, 0), off_at(1, 22, 2)]).is_empty());
    }

    #[test]
    fn test_different_buckets_do_not_recur() {
        assert!(detect(&[off_at(1, 22, 0), off_at(2, 22, 10)]).is_empty());
    }

    #[test]
    fn test_different_values_do_not_recur() {
        let mut on = off_at(2, 22, 0);
        on.value = "on".to_string();
        assert!(detect(&[off_at(1, 22, 0), on]).is_empty());
    }

    #[test]
    fn test_offset_moves_calendar_day() {
        // 23:30 UTC on two days is 00:30 the next local day at +01:00; still two days.
        let detectors = DetectorConfig {
            schedule_utc_offset_minutes: 60,
            ..DetectorConfig::default()
        };
        let detector = ScheduledPatternDetector::new(&detectors, &ConfidencePolicy::default());
        let events = [off_at(1, 23, 30), off_at(2, 23, 30)];
        let signatures = detector.detect(&DetectionInput::new("D1", &events));
        assert_eq!(signatures.len(), 1);
        assert!(signatures[0].recommendation.contains("00:30"));
    }
}
