//! Flood and anomaly detection.
//!
//! [`Detector::tick`] is one step of detection over the shared state: record
//! the drained events, classify the sources they touched, recompute the
//! global spike flag and roll the windows. [`run_detection_loop`] drives it
//! from an [`IngestionSource`] until told to stop.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{watch, RwLock};
use tokio::time::{self, MissedTickBehavior};

use crate::core::audit::AuditSink;
use crate::core::monitoring;
use crate::core::registry::{Incident, IncidentKind, IncidentRegistry};
use crate::core::source::{IngestionSource, Pacing, TrafficEvent};
use crate::core::whitelist::Whitelist;
use crate::core::window_stats::{WindowCounter, WindowStats};
use crate::core::DetectionConfig;

/// Everything the detection loop reads and writes
#[derive(Debug, Clone)]
pub struct DetectorState {
    pub(crate) stats: WindowStats,
    pub(crate) registry: IncidentRegistry,
    pub(crate) global_spike: bool,
    pub(crate) last_tick: Option<DateTime<Utc>>,
    pub(crate) ticks: u64,
    pub(crate) events_processed: u64,
    pub(crate) source_exhausted: bool,
}

impl DetectorState {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            stats: WindowStats::from_config(config),
            registry: IncidentRegistry::new(),
            global_spike: false,
            last_tick: None,
            ticks: 0,
            events_processed: 0,
            source_exhausted: false,
        }
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }

    pub fn registry(&self) -> &IncidentRegistry {
        &self.registry
    }

    pub fn global_spike(&self) -> bool {
        self.global_spike
    }

    /// Start a new run: fresh statistics, registry and blocklist kept
    pub(crate) fn begin_run(&mut self) {
        self.stats.clear();
        self.global_spike = false;
        self.last_tick = None;
        self.ticks = 0;
        self.events_processed = 0;
        self.source_exhausted = false;
    }
}

/// What happened during one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub events: usize,
    pub touched: usize,
    pub new_floods: Vec<IpAddr>,
    pub new_anomalies: Vec<IpAddr>,
    pub new_blocks: Vec<IpAddr>,
    /// Incidents closed by this tick (anomalies escalated to floods)
    pub closed: Vec<Incident>,
    /// Sources counted in `total_sources` that have an active flood incident
    pub flooding_sources: usize,
    /// Non-whitelisted sources with traffic in the trailing window
    pub total_sources: usize,
    pub global_spike: bool,
    pub evicted: usize,
}

/// Classification rules
#[derive(Debug, Clone)]
pub struct Detector {
    config: DetectionConfig,
    whitelist: Whitelist,
}

impl Detector {
    /// Create a detector, validating the configuration
    pub fn new(config: DetectionConfig) -> Result<Self, String> {
        config.validate()?;
        let whitelist = Whitelist::parse(&config.whitelist)?;
        Ok(Self { config, whitelist })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Classify a source from its trailing window.
    ///
    /// A source with an active flood incident is never reported as an anomaly.
    pub fn classify(&self, counter: &WindowCounter, flood_active: bool) -> Option<IncidentKind> {
        let rate = counter.rate(self.config.window());
        if rate >= self.config.flood_pps {
            return Some(IncidentKind::Flood);
        }
        if flood_active || counter.history.len() < self.config.min_baseline_windows {
            return None;
        }
        let baseline = counter.baseline()?;
        if baseline > 0.0 && rate > baseline * self.config.anomaly_factor {
            Some(IncidentKind::Anomaly)
        } else {
            None
        }
    }

    /// Whether the flooding population amounts to a global spike
    pub fn is_global_spike(&self, flooding: usize, total: usize, aggregate_pps: f64) -> bool {
        if total == 0 {
            return false;
        }
        let fraction = flooding as f64 / total as f64;
        fraction >= self.config.spike_fraction
            || self.config.spike_min_sources.map_or(false, |min| flooding >= min)
            || self.config.global_pps.map_or(false, |pps| aggregate_pps >= pps)
    }

    /// Run one detection step at `now` over the drained `events`
    pub fn tick(&self, state: &mut DetectorState, events: Vec<TrafficEvent>, now: DateTime<Utc>) -> TickReport {
        let window = self.config.window();
        let mut report = TickReport { events: events.len(), ..Default::default() };

        let mut touched = BTreeSet::new();
        for event in &events {
            state.stats.record(event);
            touched.insert(event.source_ip);
        }
        state.stats.advance(now);
        report.touched = touched.len();

        for ip in touched {
            if self.whitelist.contains(&ip) {
                continue;
            }
            let Some(counter) = state.stats.get(&ip) else {
                continue;
            };
            let rate = counter.rate(window);
            let flood_active = state.registry.has_active(&ip, IncidentKind::Flood);

            match self.classify(counter, flood_active) {
                Some(IncidentKind::Flood) => {
                    if state.registry.record(ip, IncidentKind::Flood, now, rate) {
                        info!("Flood detected from {}: {:.1} pps", ip, rate);
                        report.new_floods.push(ip);
                    }
                    if let Some(escalated) = state.registry.close(&ip, IncidentKind::Anomaly, now) {
                        debug!("Anomaly incident for {} escalated to flood", ip);
                        report.closed.push(escalated);
                    }
                    let reason = format!("flood: {:.1} pps >= {} pps", rate, self.config.flood_pps);
                    if state.registry.block(ip, reason, now) {
                        warn!("Blocked {} after flood detection", ip);
                        report.new_blocks.push(ip);
                    }
                }
                Some(IncidentKind::Anomaly) => {
                    if state.registry.record(ip, IncidentKind::Anomaly, now, rate) {
                        info!("Anomalous traffic from {}: {:.1} pps", ip, rate);
                        report.new_anomalies.push(ip);
                    }
                }
                None => {}
            }
        }

        let mut aggregate = 0.0;
        for (ip, rate) in state.stats.active_rates() {
            if self.whitelist.contains(&ip) {
                continue;
            }
            report.total_sources += 1;
            aggregate += rate;
            if state.registry.has_active(&ip, IncidentKind::Flood) {
                report.flooding_sources += 1;
            }
        }
        report.global_spike = self.is_global_spike(report.flooding_sources, report.total_sources, aggregate);
        if report.global_spike != state.global_spike {
            if report.global_spike {
                warn!(
                    "Global spike: {} of {} sources flooding ({:.1} pps total)",
                    report.flooding_sources, report.total_sources, aggregate
                );
            } else {
                info!("Global spike cleared");
            }
        }
        state.global_spike = report.global_spike;

        report.evicted = state.stats.maintain(now);
        state.last_tick = Some(now);
        state.ticks += 1;
        state.events_processed += report.events as u64;

        debug!(
            "Tick at {}: {} events, {} sources, {} flooding, {} evicted",
            now, report.events, report.total_sources, report.flooding_sources, report.evicted
        );
        report
    }
}

/// Drive detection until `shutdown` flips to true.
///
/// Live sources tick on the wall clock; log replays tick back to back and,
/// once the log is exhausted, hold their final state until shutdown. The
/// current tick always completes before the loop exits.
pub(crate) async fn run_detection_loop(
    mut source: IngestionSource,
    state: Arc<RwLock<DetectorState>>,
    detector: Arc<Detector>,
    audit: Arc<dyn AuditSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let description = source.describe();
    info!("Detection loop started ({})", description);

    let step = chrono::Duration::milliseconds(detector.config().tick_interval_ms as i64);
    let max_events = detector.config().max_events_per_tick;
    let mut interval = time::interval(detector.config().tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exhausted = false;

    loop {
        if exhausted {
            if !*shutdown.borrow() {
                let _ = shutdown.changed().await;
            }
            break;
        }

        match source.pacing() {
            Pacing::WallClock => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
            }
            Pacing::AsFastAsPossible => {
                if *shutdown.borrow() || shutdown.has_changed().is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        let batch = match source.drain(step, max_events).await {
            Ok(batch) => batch,
            Err(e) if e.is_transient() => {
                warn!("Ingestion error, retrying next tick: {}", e);
                continue;
            }
            Err(e) => {
                error!("Ingestion failed: {}", e);
                exhausted = true;
                state.write().await.source_exhausted = true;
                continue;
            }
        };
        exhausted = batch.exhausted;

        if batch.events.is_empty() && batch.exhausted {
            state.write().await.source_exhausted = true;
            info!("Source exhausted ({})", description);
            continue;
        }

        let report = {
            let mut guard = state.write().await;
            let report = detector.tick(&mut guard, batch.events, batch.now);
            guard.source_exhausted = batch.exhausted;
            report
        };
        for incident in &report.closed {
            audit.record(incident);
        }
        monitoring::record_tick(&report);

        if exhausted {
            info!("Source exhausted ({})", description);
        }
    }

    info!("Detection loop stopped ({})", description);
}
