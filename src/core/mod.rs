//! Core functionality for the detection service.
//!
//! This module contains the core components of the service,
//! including traffic ingestion, windowed statistics, classification,
//! the blocklist and incident registry, and the controller that owns them.

pub mod audit;
pub mod controller;
pub mod detector;
pub mod monitoring;
pub mod registry;
pub mod source;
pub mod whitelist;
pub mod window_stats;

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Detection tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Length of the rolling window per source (seconds)
    pub window_seconds: u64,
    /// Interval between detection ticks (milliseconds)
    pub tick_interval_ms: u64,
    /// Packets per second at or above which a source is a flood
    pub flood_pps: f64,
    /// How far above its own baseline a source must go to be anomalous
    pub anomaly_factor: f64,
    /// Number of completed windows kept as a source's baseline
    pub baseline_windows: usize,
    /// Completed windows required before anomaly classification applies
    pub min_baseline_windows: usize,
    /// Empty windows after which an idle source is evicted
    pub evict_after_windows: u32,
    /// Fraction of active sources flooding that raises the global spike flag
    pub spike_fraction: f64,
    /// Absolute number of flooding sources that raises the global spike flag
    pub spike_min_sources: Option<usize>,
    /// Aggregate packets per second that raises the global spike flag
    pub global_pps: Option<f64>,
    /// Upper bound on events drained from the source in a single tick
    pub max_events_per_tick: usize,
    /// Capacity of the live ingestion queue
    pub live_queue_capacity: usize,
    /// Addresses or networks that are never classified
    pub whitelist: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 10,
            tick_interval_ms: 1000,
            flood_pps: 1000.0,
            anomaly_factor: 3.0,
            baseline_windows: 6,
            min_baseline_windows: 3,
            evict_after_windows: 3,
            spike_fraction: 0.5,
            spike_min_sources: None,
            global_pps: None,
            max_events_per_tick: 100_000,
            live_queue_capacity: 65_536,
            whitelist: Vec::new(),
        }
    }
}

impl DetectionConfig {
    /// Window length as a chrono duration
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_seconds as i64)
    }

    /// Tick interval as a std duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check that every tunable is usable.
    ///
    /// Returns a human readable description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_seconds == 0 {
            return Err("window_seconds must be at least 1".to_string());
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be at least 1".to_string());
        }
        if !(self.flood_pps.is_finite() && self.flood_pps > 0.0) {
            return Err(format!("flood_pps must be positive, got {}", self.flood_pps));
        }
        if !(self.anomaly_factor.is_finite() && self.anomaly_factor > 1.0) {
            return Err(format!("anomaly_factor must be greater than 1, got {}", self.anomaly_factor));
        }
        if self.baseline_windows == 0 {
            return Err("baseline_windows must be at least 1".to_string());
        }
        if self.min_baseline_windows == 0 || self.min_baseline_windows > self.baseline_windows {
            return Err(format!(
                "min_baseline_windows must be between 1 and baseline_windows ({})",
                self.baseline_windows
            ));
        }
        if self.evict_after_windows == 0 {
            return Err("evict_after_windows must be at least 1".to_string());
        }
        if !(self.spike_fraction > 0.0 && self.spike_fraction <= 1.0) {
            return Err(format!("spike_fraction must be in (0, 1], got {}", self.spike_fraction));
        }
        if self.spike_min_sources == Some(0) {
            return Err("spike_min_sources must be at least 1 when set".to_string());
        }
        if let Some(pps) = self.global_pps {
            if !(pps.is_finite() && pps > 0.0) {
                return Err(format!("global_pps must be positive, got {}", pps));
            }
        }
        if self.max_events_per_tick == 0 || self.live_queue_capacity == 0 {
            return Err("max_events_per_tick and live_queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

pub use audit::{AuditSink, LogAuditSink, RedisAuditSink};
pub use controller::{Controller, ControllerError, DetectorMode, DetectorStatus, Snapshot};
pub use detector::{Detector, DetectorState, TickReport};
pub use registry::{BlockedEntry, Incident, IncidentKind, IncidentRegistry};
pub use source::{IngestionSource, LiveFeed, SourceError, TrafficEvent};
pub use whitelist::Whitelist;
pub use window_stats::{WindowCounter, WindowStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DetectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_tunables_are_rejected() {
        let config = DetectionConfig { window_seconds: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = DetectionConfig { anomaly_factor: 0.5, ..Default::default() };
        assert!(config.validate().is_err());

        let config = DetectionConfig { min_baseline_windows: 7, ..Default::default() };
        assert!(config.validate().is_err());

        let config = DetectionConfig { spike_fraction: 0.0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
