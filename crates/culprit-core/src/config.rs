//! Configuration management for the diagnosis engine.
//!
//! Loads settings from `$CULPRIT_CONFIG` or /etc/culprit/config.toml, or uses
//! defaults. Every field has a serde default so partial files are fine.

use anyhow::{bail, Result};
use culprit_shared::StageBudget;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/culprit/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "CULPRIT_CONFIG";

/// Rule index cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live of a location's index in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of locations kept (LRU-evicted)
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_capacity() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Pattern detector thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Flips faster than this count as rapid changes
    #[serde(default = "default_rapid_threshold")]
    pub rapid_change_threshold_ms: i64,

    /// Flips faster than this get the high confidence bucket
    #[serde(default = "default_rapid_high")]
    pub rapid_change_high_ms: i64,

    /// Events that must take part in rapid flips before a signature is emitted
    #[serde(default = "default_rapid_min_events")]
    pub rapid_change_min_events: usize,

    /// Time-of-day bucket width in minutes
    #[serde(default = "default_bucket_minutes")]
    pub schedule_bucket_minutes: u32,

    /// Distinct calendar days a change must recur on
    #[serde(default = "default_min_days")]
    pub schedule_min_days: usize,

    /// Offset applied before bucketing wall-clock time
    #[serde(default)]
    pub schedule_utc_offset_minutes: i32,

    /// How far back another device's change may precede the target's change
    #[serde(default = "default_trigger_window")]
    pub trigger_window_ms: i64,

    /// Correlations with one device needed before a signature is emitted
    #[serde(default = "default_trigger_min")]
    pub trigger_min_occurrences: usize,
}

fn default_rapid_threshold() -> i64 {
    5_000
}

fn default_rapid_high() -> i64 {
    3_000
}

fn default_rapid_min_events() -> usize {
    2
}

fn default_bucket_minutes() -> u32 {
    5
}

fn default_min_days() -> usize {
    2
}

fn default_trigger_window() -> i64 {
    2_000
}

fn default_trigger_min() -> usize {
    2
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rapid_change_threshold_ms: default_rapid_threshold(),
            rapid_change_high_ms: default_rapid_high(),
            rapid_change_min_events: default_rapid_min_events(),
            schedule_bucket_minutes: default_bucket_minutes(),
            schedule_min_days: default_min_days(),
            schedule_utc_offset_minutes: 0,
            trigger_window_ms: default_trigger_window(),
            trigger_min_occurrences: default_trigger_min(),
        }
    }
}

/// Confidence policy constants. Defaults are policy, not derived statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    #[serde(default = "default_fight_high")]
    pub automation_fight_high: f64,

    #[serde(default = "default_fight_low")]
    pub automation_fight_low: f64,

    #[serde(default = "default_scheduled")]
    pub scheduled_automation: f64,

    #[serde(default = "default_triggered")]
    pub triggered_automation: f64,

    /// Scale pattern-only confidence when cross-device data was missing
    #[serde(default)]
    pub penalize_missing_cross_device: bool,

    #[serde(default = "default_cross_device_penalty")]
    pub cross_device_penalty: f64,
}

fn default_fight_high() -> f64 {
    0.95
}

fn default_fight_low() -> f64 {
    0.85
}

fn default_scheduled() -> f64 {
    0.75
}

fn default_triggered() -> f64 {
    0.70
}

fn default_cross_device_penalty() -> f64 {
    0.9
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            automation_fight_high: default_fight_high(),
            automation_fight_low: default_fight_low(),
            scheduled_automation: default_scheduled(),
            triggered_automation: default_triggered(),
            penalize_missing_cross_device: false,
            cross_device_penalty: default_cross_device_penalty(),
        }
    }
}

/// Evidence fetch timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_event_history_timeout")]
    pub event_history_ms: u64,

    /// Used when the location's index is already cached
    #[serde(default = "default_cached_index_timeout")]
    pub cached_index_ms: u64,

    /// Used when the index must be rebuilt from the catalog
    #[serde(default = "default_cold_catalog_timeout")]
    pub cold_catalog_ms: u64,
}

fn default_event_history_timeout() -> u64 {
    5_000
}

fn default_cached_index_timeout() -> u64 {
    2_000
}

fn default_cold_catalog_timeout() -> u64 {
    8_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            event_history_ms: default_event_history_timeout(),
            cached_index_ms: default_cached_index_timeout(),
            cold_catalog_ms: default_cold_catalog_timeout(),
        }
    }
}

impl TimeoutConfig {
    /// Stage budget for one request, picking the index timeout by cache state.
    pub fn to_stage_budget(&self, index_cached: bool) -> StageBudget {
        StageBudget {
            event_history_ms: self.event_history_ms,
            rule_index_ms: if index_cached {
                self.cached_index_ms
            } else {
                self.cold_catalog_ms
            },
            ..StageBudget::default()
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub detectors: DetectorConfig,

    #[serde(default)]
    pub confidence: ConfidencePolicy,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load config from `$CULPRIT_CONFIG` or the default path, or return defaults
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_PATH.to_string());
        Self::load_from_path(&path).unwrap_or_else(|e| {
            warn!("Config not loaded from {}, using defaults: {}", path, e);
            Config::default()
        })
    }

    /// Load and validate config from a specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make detectors or the cache misbehave
    pub fn validate(&self) -> Result<()> {
        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than zero");
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be greater than zero");
        }

        let d = &self.detectors;
        if d.rapid_change_threshold_ms <= 0 || d.trigger_window_ms < 0 {
            bail!("detector windows must be positive");
        }
        if d.rapid_change_high_ms > d.rapid_change_threshold_ms {
            bail!("detectors.rapid_change_high_ms must not exceed rapid_change_threshold_ms");
        }
        if d.schedule_bucket_minutes == 0 || d.schedule_bucket_minutes > 24 * 60 {
            bail!("detectors.schedule_bucket_minutes must be within 1..=1440");
        }
        if d.schedule_utc_offset_minutes.abs() >= 24 * 60 {
            bail!("detectors.schedule_utc_offset_minutes must be under a day");
        }

        let c = &self.confidence;
        for (name, value) in [
            ("automation_fight_high", c.automation_fight_high),
            ("automation_fight_low", c.automation_fight_low),
            ("scheduled_automation", c.scheduled_automation),
            ("triggered_automation", c.triggered_automation),
            ("cross_device_penalty", c.cross_device_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("confidence.{} must be within [0, 1], got {}", name, value);
            }
        }

        Ok(())
    }

    /// Save default config to path (for init)
    pub fn save_default(path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.detectors.rapid_change_threshold_ms, 5_000);
        assert_eq!(config.detectors.schedule_bucket_minutes, 5);
        assert_eq!(config.confidence.automation_fight_high, 0.95);
        assert_eq!(config.timeouts.cached_index_ms, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            ttl_secs = 60

            [confidence]
            penalize_missing_cross_device = true
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.capacity, 256);
        assert!(config.confidence.penalize_missing_cross_device);
        assert_eq!(config.confidence.scheduled_automation, 0.75);
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let err = Config::from_toml_str("[confidence]\nscheduled_automation = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("scheduled_automation"));
    }

    #[test]
    fn test_direct_match_not_configurable() {
        // Older files may still carry the key; it must not change anything.
        let config = Config::from_toml_str("[confidence]\ndirect_match = 0.5\n").unwrap();
        let rendered = toml::to_string(&config.confidence).unwrap();
        assert!(!rendered.contains("direct_match"));
        assert_eq!(config.confidence.scheduled_automation, 0.75);
    }

    #[test]
    fn test_rejects_inverted_rapid_thresholds() {
        let result = Config::from_toml_str(
            "[detectors]\nrapid_change_threshold_ms = 2000\nrapid_change_high_ms = 3000\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stage_budget_picks_index_timeout() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.to_stage_budget(true).rule_index_ms, 2_000);
        assert_eq!(timeouts.to_stage_budget(false).rule_index_ms, 8_000);
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::save_default(&path).unwrap();
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.cache.ttl_secs, 300);
    }
}
