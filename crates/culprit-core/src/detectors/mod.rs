//! Pattern Detectors
//!
//! Independent analyzers over a device's event window. Each one is a pure
//! function of its input: no shared mutable state, so running one never
//! changes what another returns, and run order does not matter.
//!
//! - `RapidChangeDetector` - values flipping back and forth within seconds
//! - `ScheduledPatternDetector` - same change at the same time on several days
//! - `TriggeredPatternDetector` - changes that follow another device's changes

pub mod rapid;
pub mod scheduled;
pub mod triggered;

pub use rapid::RapidChangeDetector;
pub use scheduled::ScheduledPatternDetector;
pub use triggered::TriggeredPatternDetector;

use crate::config::Config;
use culprit_shared::pattern::sort_signatures;
use culprit_shared::{DeviceEvent, PatternSignature};
use tracing::debug;

/// Everything a detector may look at.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub device_id: &'a str,
    /// The target device's events for the window
    pub events: &'a [DeviceEvent],
    /// Events from other devices in the same location, when the caller has them
    pub cross_device: Option<&'a [DeviceEvent]>,
}

impl<'a> DetectionInput<'a> {
    pub fn new(device_id: &'a str, events: &'a [DeviceEvent]) -> Self {
        Self {
            device_id,
            events,
            cross_device: None,
        }
    }

    pub fn with_cross_device(mut self, events: &'a [DeviceEvent]) -> Self {
        self.cross_device = Some(events);
        self
    }
}

/// A behavioral pattern analyzer.
pub trait PatternDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<PatternSignature>;
}

/// The detectors a diagnosis runs.
pub struct DetectorSet {
    detectors: Vec<Box<dyn PatternDetector>>,
}

impl DetectorSet {
    pub fn new(detectors: Vec<Box<dyn PatternDetector>>) -> Self {
        Self { detectors }
    }

    /// The three standard detectors configured from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            Box::new(RapidChangeDetector::new(&config.detectors, &config.confidence)),
            Box::new(ScheduledPatternDetector::new(&config.detectors, &config.confidence)),
            Box::new(TriggeredPatternDetector::new(&config.detectors, &config.confidence)),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector and return signatures strongest first.
    pub fn run(&self, input: &DetectionInput<'_>) -> Vec<PatternSignature> {
        let mut signatures = Vec::new();
        for detector in &self.detectors {
            let found = detector.detect(input);
            debug!("Detector {} found {} signatures", detector.name(), found.len());
            signatures.extend(found);
        }
        sort_signatures(&mut signatures);
        signatures
    }
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Events sorted by epoch then hash, borrowed.
pub(crate) fn ordered(events: &[DeviceEvent]) -> Vec<&DeviceEvent> {
    let mut refs: Vec<&DeviceEvent> = events.iter().collect();
    refs.sort_by(|a, b| a.epoch_ms.cmp(&b.epoch_ms).then_with(|| a.hash.cmp(&b.hash)));
    refs
}
