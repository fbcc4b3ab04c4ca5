//! Culprit Core - finds the automation behind a misbehaving device.
//!
//! Reads a device's recent events and its location's rule catalog, then
//! returns one confidence-scored `Diagnosis` naming the responsible rules
//! and/or behavioral patterns.
//!
//! - `rule_index` caches a device -> rule reverse index per location
//! - `detectors` infer patterns from event timing
//! - `aggregator` merges both into one confidence
//! - `orchestrator` runs the fetches under timeouts and degrades gracefully
//!
//! The crate logs through `tracing` and never installs a subscriber.

pub mod aggregator;
pub mod config;
pub mod detectors;
pub mod extractor;
pub mod orchestrator;
pub mod providers;
pub mod rule_index;

pub use aggregator::{aggregate, Aggregate, AggregationContext};
pub use config::Config;
pub use detectors::{
    DetectionInput, DetectorSet, PatternDetector, RapidChangeDetector, ScheduledPatternDetector,
    TriggeredPatternDetector,
};
pub use extractor::{extract_references, DeviceReference, Extraction};
pub use orchestrator::{Diagnoser, DiagnosisRequest};
pub use providers::{EventHistoryProvider, FakeEventHistory, FakeRuleCatalog, RuleCatalogProvider};
pub use rule_index::{IndexLookup, RuleIndex};

pub use culprit_shared;
