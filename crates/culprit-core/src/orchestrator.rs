//! Diagnosis Orchestrator
//!
//! Drives one diagnosis through `Idle -> FetchingEvidence -> Aggregating`
//! and ends in `Done` or `DegradedDone`.
//!
//! Event history and the rule index are fetched concurrently, each bounded by
//! its own timeout. Related devices' histories are fetched in parallel under
//! the event history budget. A source that fails or times out degrades the diagnosis
//! instead of failing it; only when every evidence source is gone does the
//! caller get an error. Cancellation drops the in-flight fetches, and the rule
//! index never writes an entry for a fetch that did not complete.

use crate::aggregator::{aggregate, AggregationContext};
use crate::config::Config;
use crate::detectors::{DetectionInput, DetectorSet};
use crate::providers::{EventHistoryProvider, RuleCatalogProvider};
use crate::rule_index::{IndexLookup, RuleIndex};
use chrono::Utc;
use culprit_shared::{
    sort_events, DegradedSource, DeviceEvent, Diagnosis, DiagnosisError, DiagnosisMetadata,
    DiagnosisState, EvidenceSource, IndexFreshness, ProviderError, Stage, StageBudget, StageClock,
    TimeWindow,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One diagnosis request.
///
/// Callers that already hold the device's events (or other devices' events)
/// can hand them over and skip the corresponding fetch.
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    pub device_id: String,
    pub location_id: String,
    pub window: TimeWindow,
    /// Pre-fetched events for the target device
    pub events: Option<Vec<DeviceEvent>>,
    /// Pre-fetched events from other devices in the location
    pub cross_device_events: Option<Vec<DeviceEvent>>,
    /// Other devices whose history should be fetched for cascade detection
    pub related_devices: Vec<String>,
}

impl DiagnosisRequest {
    pub fn new(
        device_id: impl Into<String>,
        location_id: impl Into<String>,
        window: TimeWindow,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            location_id: location_id.into(),
            window,
            events: None,
            cross_device_events: None,
            related_devices: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<DeviceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cross_device_events(mut self, events: Vec<DeviceEvent>) -> Self {
        self.cross_device_events = Some(events);
        self
    }

    pub fn with_related_devices(mut self, device_ids: Vec<String>) -> Self {
        self.related_devices = device_ids;
        self
    }

    pub fn validate(&self) -> Result<(), DiagnosisError> {
        if self.device_id.trim().is_empty() {
            return Err(DiagnosisError::InvalidRequest("device id is empty".to_string()));
        }
        if self.location_id.trim().is_empty() {
            return Err(DiagnosisError::InvalidRequest("location id is empty".to_string()));
        }
        if !self.window.is_valid() {
            return Err(DiagnosisError::InvalidRequest(format!(
                "window starts after it ends ({} > {})",
                self.window.start, self.window.end
            )));
        }
        Ok(())
    }
}

struct EventsFetch {
    result: Result<Vec<DeviceEvent>, String>,
    elapsed_ms: u64,
    skipped: bool,
}

struct IndexFetch {
    lookup: IndexLookup,
    elapsed_ms: u64,
}

/// Runs diagnoses against one rule index and one event history provider.
pub struct Diagnoser {
    config: Config,
    rule_index: Arc<RuleIndex>,
    history: Arc<dyn EventHistoryProvider>,
    detectors: DetectorSet,
}

impl Diagnoser {
    /// Build around an existing index, so several diagnosers can share one cache.
    pub fn new(
        config: Config,
        rule_index: Arc<RuleIndex>,
        history: Arc<dyn EventHistoryProvider>,
    ) -> Self {
        let detectors = DetectorSet::from_config(&config);
        Self {
            config,
            rule_index,
            history,
            detectors,
        }
    }

    /// Build with a fresh index sized from `config.cache`.
    pub fn from_config(
        config: Config,
        catalog: Arc<dyn RuleCatalogProvider>,
        history: Arc<dyn EventHistoryProvider>,
    ) -> Self {
        let rule_index = Arc::new(RuleIndex::new(
            catalog,
            config.cache.capacity,
            config.cache.ttl(),
        ));
        Self::new(config, rule_index, history)
    }

    pub fn with_detectors(mut self, detectors: DetectorSet) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rule_index(&self) -> &Arc<RuleIndex> {
        &self.rule_index
    }

    /// Forget the cached index for a location after a known rule change.
    pub async fn invalidate(&self, location_id: &str) {
        self.rule_index.invalidate(location_id).await;
    }

    /// Diagnose a device over a window.
    pub async fn diagnose(
        &self,
        device_id: &str,
        location_id: &str,
        window: TimeWindow,
    ) -> Result<Diagnosis, DiagnosisError> {
        self.diagnose_request(
            DiagnosisRequest::new(device_id, location_id, window),
            CancellationToken::new(),
        )
        .await
    }

    /// Diagnose with pre-supplied evidence and caller-controlled cancellation.
    pub async fn diagnose_request(
        &self,
        mut request: DiagnosisRequest,
        cancel: CancellationToken,
    ) -> Result<Diagnosis, DiagnosisError> {
        request.validate()?;

        let diagnosis_id = Uuid::new_v4();
        let mut state = DiagnosisState::Idle;
        info!(
            "[{}] Diagnosing {} at {}",
            diagnosis_id, request.device_id, request.location_id
        );

        let index_cached = self.rule_index.has_fresh_entry(&request.location_id).await;
        let budget = self.config.timeouts.to_stage_budget(index_cached);
        let mut clock = StageClock::new(budget);

        let supplied_events = request.events.take();
        let supplied_cross = request.cross_device_events.take();

        advance(&mut state, DiagnosisState::FetchingEvidence, diagnosis_id);
        let evidence = async {
            tokio::join!(
                self.fetch_events(&request, supplied_events, &budget),
                self.fetch_index(&request, &budget),
                self.fetch_cross_device(&request, supplied_cross, &budget)
            )
        };
        let (events, index, cross) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("[{}] Diagnosis cancelled while fetching evidence", diagnosis_id);
                return Err(DiagnosisError::Cancelled);
            }
            fetched = evidence => fetched,
        };

        if events.skipped {
            clock.record_skipped(Stage::EventHistory);
        } else {
            clock.record_elapsed(Stage::EventHistory, events.elapsed_ms);
        }
        clock.record_elapsed(Stage::RuleIndex, index.elapsed_ms);

        let mut degraded: Vec<DegradedSource> = Vec::new();

        let events = match events.result {
            Ok(events) => Some(events),
            Err(reason) => {
                warn!("[{}] Event history unavailable: {}", diagnosis_id, reason);
                degraded.push(DegradedSource {
                    source: EvidenceSource::EventHistory,
                    reason,
                });
                None
            }
        };

        let lookup = index.lookup;
        match &lookup.freshness {
            IndexFreshness::Stale { reason } => {
                warn!("[{}] Using last known rule index: {}", diagnosis_id, reason);
                degraded.push(DegradedSource {
                    source: EvidenceSource::RuleCatalog,
                    reason: format!("served last known index: {}", reason),
                });
            }
            IndexFreshness::Unavailable { reason } => {
                warn!("[{}] Rule index unavailable: {}", diagnosis_id, reason);
                degraded.push(DegradedSource {
                    source: EvidenceSource::RuleCatalog,
                    reason: reason.clone(),
                });
            }
            IndexFreshness::Cached | IndexFreshness::Rebuilt => {}
        }

        let index_unavailable = matches!(lookup.freshness, IndexFreshness::Unavailable { .. });
        if events.is_none() && index_unavailable {
            warn!("[{}] No evidence source available", diagnosis_id);
            return Err(DiagnosisError::EvidenceUnavailable {
                failures: degraded
                    .into_iter()
                    .map(|d| (d.source, d.reason))
                    .collect(),
            });
        }

        let cross_device = match cross {
            Some(Ok(events)) => Some(events),
            Some(Err(reason)) => {
                warn!("[{}] Cross-device events unavailable: {}", diagnosis_id, reason);
                degraded.push(DegradedSource {
                    source: EvidenceSource::CrossDeviceEvents,
                    reason,
                });
                None
            }
            None => None,
        };

        advance(&mut state, DiagnosisState::Aggregating, diagnosis_id);
        let events = events.unwrap_or_default();

        let started = Instant::now();
        let mut input = DetectionInput::new(&request.device_id, &events);
        if let Some(cross) = cross_device.as_deref() {
            input = input.with_cross_device(cross);
        }
        let patterns = self.detectors.run(&input);
        clock.record(Stage::Detection, started);

        let started = Instant::now();
        let catalog_auth_error = lookup
            .error
            .as_ref()
            .map(ProviderError::is_auth)
            .unwrap_or(false);
        let context = AggregationContext {
            cross_device_coverage: cross_device.is_some(),
            catalog_auth_error,
        };
        let outcome = aggregate(&lookup.matches, &patterns, &self.config.confidence, context);
        clock.record(Stage::Aggregation, started);

        let terminal = if degraded.is_empty() {
            DiagnosisState::Done
        } else {
            DiagnosisState::DegradedDone
        };
        advance(&mut state, terminal, diagnosis_id);

        let total_ms = clock.total_elapsed_ms();
        let diagnosis = Diagnosis {
            diagnosis_id,
            device_id: request.device_id,
            location_id: request.location_id,
            window: request.window,
            state,
            basis: outcome.basis,
            rule_matches: lookup.matches,
            patterns,
            overall_confidence: outcome.overall_confidence,
            recommendations: outcome.recommendations,
            metadata: DiagnosisMetadata {
                rules_analyzed: lookup.rules_analyzed,
                events_analyzed: events.len(),
                cross_device_events_analyzed: cross_device.as_ref().map_or(0, Vec::len),
                cross_device_coverage: context.cross_device_coverage,
                index_freshness: Some(lookup.freshness),
                degraded,
                catalog_auth_error,
                timings: clock.into_timings(),
                total_ms,
            },
            generated_at: Utc::now(),
        };

        info!("Diagnosis {}", diagnosis.summary_line());
        Ok(diagnosis)
    }

    async fn fetch_events(
        &self,
        request: &DiagnosisRequest,
        supplied: Option<Vec<DeviceEvent>>,
        budget: &StageBudget,
    ) -> EventsFetch {
        if let Some(mut events) = supplied {
            sort_events(&mut events);
            return EventsFetch {
                result: Ok(events),
                elapsed_ms: 0,
                skipped: true,
            };
        }

        let started = Instant::now();
        let fetch = self.history.get_events(&request.device_id, &request.window);
        let result = match tokio::time::timeout(budget.duration(Stage::EventHistory), fetch).await {
            Ok(Ok(events)) => {
                debug!("Fetched {} events for {}", events.len(), request.device_id);
                Ok(events)
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(ProviderError::Timeout(budget.event_history_ms).to_string()),
        };

        EventsFetch {
            result,
            elapsed_ms: started.elapsed().as_millis() as u64,
            skipped: false,
        }
    }

    async fn fetch_index(&self, request: &DiagnosisRequest, budget: &StageBudget) -> IndexFetch {
        let started = Instant::now();
        let lookup = self
            .rule_index
            .lookup_within(
                &request.device_id,
                &request.location_id,
                budget.duration(Stage::RuleIndex),
            )
            .await;
        IndexFetch {
            lookup,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// `None` when the caller neither supplied cross-device events nor named
    /// related devices.
    async fn fetch_cross_device(
        &self,
        request: &DiagnosisRequest,
        supplied: Option<Vec<DeviceEvent>>,
        budget: &StageBudget,
    ) -> Option<Result<Vec<DeviceEvent>, String>> {
        if let Some(mut events) = supplied {
            sort_events(&mut events);
            return Some(Ok(events));
        }
        if request.related_devices.is_empty() {
            return None;
        }

        // One task per related device; dropping the set on timeout aborts the rest.
        let mut fetches = JoinSet::new();
        let mut seen = BTreeSet::new();
        for device_id in &request.related_devices {
            if *device_id == request.device_id || !seen.insert(device_id.as_str()) {
                continue;
            }
            let history = Arc::clone(&self.history);
            let device_id = device_id.clone();
            let window = request.window;
            fetches.spawn(async move { history.get_events(&device_id, &window).await });
        }
        debug!("Fetching history for {} related devices", fetches.len());

        let fetch_all = async {
            let mut all = Vec::new();
            while let Some(joined) = fetches.join_next().await {
                let events = joined
                    .map_err(|err| ProviderError::Other(format!("fetch task failed: {}", err)))??;
                all.extend(events);
            }
            Ok::<_, ProviderError>(all)
        };

        let result = match tokio::time::timeout(budget.duration(Stage::EventHistory), fetch_all).await
        {
            Ok(Ok(mut events)) => {
                sort_events(&mut events);
                Ok(events)
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(ProviderError::Timeout(budget.event_history_ms).to_string()),
        };
        Some(result)
    }
}

fn advance(state: &mut DiagnosisState, next: DiagnosisState, diagnosis_id: Uuid) {
    debug!("[{}] {:?} -> {:?}", diagnosis_id, state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{FakeEventHistory, FakeRuleCatalog};
    use chrono::{DateTime, Duration};
    use culprit_shared::{AutomationRule, DiagnosisBasis, RuleAction};

    fn window() -> TimeWindow {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        TimeWindow::new(start, start + Duration::days(30))
    }

    fn diagnoser(catalog: &FakeRuleCatalog, history: &FakeEventHistory) -> Diagnoser {
        Diagnoser::from_config(
            Config::default(),
            Arc::new(catalog.clone()),
            Arc::new(history.clone()),
        )
    }

    #[tokio::test]
    async fn test_direct_match_done() {
        let catalog = FakeRuleCatalog::with_rules(
            "loc",
            vec![AutomationRule::new("r1", "Night off")
                .with_action(RuleAction::command(&["D1"], "switch", "off"))],
        );
        let history = FakeEventHistory::new();
        let diagnosis = diagnoser(&catalog, &history)
            .diagnose("D1", "loc", window())
            .await
            .unwrap();

        assert_eq!(diagnosis.state, DiagnosisState::Done);
        assert_eq!(diagnosis.basis, DiagnosisBasis::DirectMatch);
        assert_eq!(diagnosis.overall_confidence, 1.0);
        assert_eq!(diagnosis.metadata.rules_analyzed, 1);
        assert_eq!(diagnosis.metadata.index_freshness, Some(IndexFreshness::Rebuilt));
        assert_eq!(diagnosis.metadata.timings.len(), 4);
        assert_eq!(history.call_count(), 1);
    }

    #[tokio::test]
    async fn test_supplied_events_skip_fetch() {
        let catalog = FakeRuleCatalog::new();
        let history = FakeEventHistory::new();
        let request = DiagnosisRequest::new("D1", "loc", window()).with_events(vec![
            DeviceEvent::new("D1", "switch", "switch", "on", 2_100),
            DeviceEvent::new("D1", "switch", "switch", "off", 0),
        ]);

        let diagnosis = diagnoser(&catalog, &history)
            .diagnose_request(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(history.call_count(), 0);
        assert!(diagnosis.metadata.timings[0].skipped);
        assert_eq!(diagnosis.metadata.events_analyzed, 2);
        assert_eq!(diagnosis.overall_confidence, 0.95);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let catalog = FakeRuleCatalog::new();
        let history = FakeEventHistory::new();
        let diagnoser = diagnoser(&catalog, &history);

        let err = diagnoser.diagnose(" ", "loc", window()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let inverted = TimeWindow::new(window().end, window().start);
        let err = diagnoser.diagnose("D1", "loc", inverted).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::InvalidRequest(_)));
        assert_eq!(catalog.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let catalog = FakeRuleCatalog::new();
        let history = FakeEventHistory::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = diagnoser(&catalog, &history)
            .diagnose_request(DiagnosisRequest::new("D1", "loc", window()), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, DiagnosisError::Cancelled);
    }
}
