//! Evidence provider traits
//!
//! The engine reads two external collaborators: the platform's event history
//! and its rule catalog. Production code implements these traits over the
//! platform API; tests use the fakes below with pre-configured responses,
//! injectable failures and delays, and call counters for assertions.

use async_trait::async_trait;
use culprit_shared::{sort_events, AutomationRule, DeviceEvent, ProviderError, TimeWindow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Provider Traits
// ============================================================================

/// Supplies ordered attribute-change events for a device.
///
/// Short provider-side retention is not an error: return what exists.
#[async_trait]
pub trait EventHistoryProvider: Send + Sync {
    /// Events for `device_id` inside `window`, ascending by timestamp
    async fn get_events(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<DeviceEvent>, ProviderError>;
}

/// Supplies the automation rules visible for a location.
///
/// An empty list is a normal answer: not every automation is exposed.
#[async_trait]
pub trait RuleCatalogProvider: Send + Sync {
    async fn list_rules(&self, location_id: &str) -> Result<Vec<AutomationRule>, ProviderError>;
}

// ============================================================================
// Fake Rule Catalog (Testing)
// ============================================================================

#[derive(Default)]
struct FakeCatalogState {
    rules: HashMap<String, Vec<AutomationRule>>,
    failure: Option<ProviderError>,
    delay: Duration,
    call_counts: HashMap<String, usize>,
}

/// Fake rule catalog for deterministic testing
///
/// ```rust,ignore
/// let catalog = FakeRuleCatalog::new();
/// catalog.set_rules("loc-1", vec![rule]);
/// let rules = catalog.list_rules("loc-1").await?;
/// assert_eq!(catalog.call_count("loc-1"), 1);
/// ```
#[derive(Clone, Default)]
pub struct FakeRuleCatalog {
    state: Arc<Mutex<FakeCatalogState>>,
}

impl FakeRuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(location_id: &str, rules: Vec<AutomationRule>) -> Self {
        let fake = Self::new();
        fake.set_rules(location_id, rules);
        fake
    }

    pub fn set_rules(&self, location_id: &str, rules: Vec<AutomationRule>) {
        self.state
            .lock()
            .unwrap()
            .rules
            .insert(location_id.to_string(), rules);
    }

    /// Make every subsequent call fail with `error`
    pub fn fail_with(&self, error: ProviderError) {
        self.state.lock().unwrap().failure = Some(error);
    }

    pub fn clear_failure(&self) {
        self.state.lock().unwrap().failure = None;
    }

    /// Delay every subsequent call by `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Number of calls made for a location
    pub fn call_count(&self, location_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .call_counts
            .get(location_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().call_counts.values().sum()
    }
}

#[async_trait]
impl RuleCatalogProvider for FakeRuleCatalog {
    async fn list_rules(&self, location_id: &str) -> Result<Vec<AutomationRule>, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state
                .call_counts
                .entry(location_id.to_string())
                .or_insert(0) += 1;
            state.delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        Ok(state.rules.get(location_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Fake Event History (Testing)
// ============================================================================

#[derive(Default)]
struct FakeHistoryState {
    events: HashMap<String, Vec<DeviceEvent>>,
    failure: Option<ProviderError>,
    delay: Duration,
    calls: usize,
}

/// Fake event history for deterministic testing
#[derive(Clone, Default)]
pub struct FakeEventHistory {
    state: Arc<Mutex<FakeHistoryState>>,
}

impl FakeEventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a flat event list, grouped by device
    pub fn with_events(events: Vec<DeviceEvent>) -> Self {
        let fake = Self::new();
        for event in events {
            fake.push(event);
        }
        fake
    }

    pub fn push(&self, event: DeviceEvent) {
        self.state
            .lock()
            .unwrap()
            .events
            .entry(event.device_id.clone())
            .or_default()
            .push(event);
    }

    pub fn fail_with(&self, error: ProviderError) {
        self.state.lock().unwrap().failure = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl EventHistoryProvider for FakeEventHistory {
    async fn get_events(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<DeviceEvent>, ProviderError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            state.delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }

        let mut events: Vec<DeviceEvent> = state
            .events
            .get(device_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| window.contains(e.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_events(&mut events);
        Ok(events)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_fake_catalog_counts_calls() {
        let fake = FakeRuleCatalog::with_rules("loc", vec![AutomationRule::new("r1", "One")]);
        assert_eq!(fake.call_count("loc"), 0);

        let rules = fake.list_rules("loc").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(fake.call_count("loc"), 1);

        let rules = fake.list_rules("other").await.unwrap();
        assert!(rules.is_empty());
        assert_eq!(fake.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_fake_catalog_failure() {
        let fake = FakeRuleCatalog::new();
        fake.fail_with(ProviderError::Auth("missing r:rules:*".into()));
        let err = fake.list_rules("loc").await.unwrap_err();
        assert!(err.is_auth());

        fake.clear_failure();
        assert!(fake.list_rules("loc").await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_history_filters_window_and_sorts() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let fake = FakeEventHistory::with_events(vec![
            DeviceEvent::at("D1", "switch", "switch", "on", base + chrono::Duration::seconds(5)),
            DeviceEvent::at("D1", "switch", "switch", "off", base),
            DeviceEvent::at("D1", "switch", "switch", "on", base - chrono::Duration::days(2)),
            DeviceEvent::at("D2", "switch", "switch", "on", base),
        ]);

        let window = TimeWindow::new(base - chrono::Duration::hours(1), base + chrono::Duration::hours(1));
        let events = fake.get_events("D1", &window).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].value, "off");
        assert_eq!(fake.call_count(), 1);
    }
}
