//! Device attribute-change events and the time windows they are fetched for.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One observed attribute change on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device_id: String,
    pub capability: String,
    pub attribute: String,
    pub value: String,
    /// Human-readable timestamp (RFC 3339 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Epoch milliseconds, used for ordering and gap arithmetic
    pub epoch_ms: i64,
    /// Disambiguates events that share the same epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl DeviceEvent {
    /// Build an event from epoch milliseconds; the readable timestamp is derived.
    pub fn new(
        device_id: impl Into<String>,
        capability: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        epoch_ms: i64,
    ) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(epoch_ms)
            .single()
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
        Self {
            device_id: device_id.into(),
            capability: capability.into(),
            attribute: attribute.into(),
            value: value.into(),
            timestamp,
            epoch_ms,
            hash: None,
        }
    }

    /// Build an event from a wall-clock timestamp.
    pub fn at(
        device_id: impl Into<String>,
        capability: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(
            device_id,
            capability,
            attribute,
            value,
            timestamp.timestamp_millis(),
        )
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Key identifying the attribute this event changed ("switch.switch").
    pub fn attribute_key(&self) -> String {
        format!("{}.{}", self.capability, self.attribute)
    }
}

/// Sort events ascending by epoch, breaking same-epoch ties on the hash.
pub fn sort_events(events: &mut [DeviceEvent]) {
    events.sort_by(|a, b| {
        a.epoch_ms
            .cmp(&b.epoch_ms)
            .then_with(|| a.hash.cmp(&b.hash))
    });
}

/// Bounded historical window a diagnosis looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window ending now and reaching back `hours`.
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::hours(hours),
            end,
        }
    }

    /// Window ending now and reaching back `days`.
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}
