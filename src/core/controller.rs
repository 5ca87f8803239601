//! Detector lifecycle and the entry point for every caller.
//!
//! The [`Controller`] owns the shared detection state and at most one
//! running detection loop. `start` and `stop` are serialized on the
//! lifecycle lock; `stop` does not return until the loop has exited.
//! Snapshot queries copy data out under a read lock and work in any state.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::core::audit::AuditSink;
use crate::core::detector::{run_detection_loop, Detector, DetectorState};
use crate::core::monitoring;
use crate::core::registry::{BlockedEntry, Incident, IncidentKind};
use crate::core::source::{live_channel, IngestionSource, LiveFeed, LogReplaySource, SourceError, TrafficEvent};
use crate::core::window_stats::WindowCounter;
use crate::core::DetectionConfig;
use crate::utils::ip_strings;

/// Errors returned by controller operations
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("detector is already running")]
    AlreadyRunning,
    #[error("detector is not running")]
    NotRunning,
    #[error("detector is running in {0} mode")]
    ModeMismatch(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Where a detector run takes its traffic from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorMode {
    Live,
    LogReplay { log_path: PathBuf },
}

impl DetectorMode {
    /// Build a mode from its wire form (`"live"` or `"log"`)
    pub fn parse(mode: &str, log_path: Option<&str>) -> Result<Self, ControllerError> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(DetectorMode::Live),
            "log" => {
                let path = log_path
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .ok_or_else(|| ControllerError::InvalidConfig("log mode requires a log_path".to_string()))?;
                Ok(DetectorMode::LogReplay { log_path: PathBuf::from(path) })
            }
            "" => Err(ControllerError::InvalidConfig("mode is required".to_string())),
            other => Err(ControllerError::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DetectorMode::Live => "live",
            DetectorMode::LogReplay { .. } => "log",
        }
    }
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorMode::Live => f.write_str("live"),
            DetectorMode::LogReplay { log_path } => write!(f, "log ({})", log_path.display()),
        }
    }
}

/// Point-in-time view polled by the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub high_traffic_ips: Vec<String>,
    pub anomalous_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub global_spike: bool,
}

/// Lifecycle and progress of the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub running: bool,
    pub mode: Option<String>,
    pub log_path: Option<String>,
    pub ticks: u64,
    pub events_processed: u64,
    pub active_sources: usize,
    pub last_tick: Option<DateTime<Utc>>,
    pub source_exhausted: bool,
    pub global_spike: bool,
}

struct Worker {
    mode: DetectorMode,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Worker),
}

/// Detection and mitigation controller
pub struct Controller {
    detector: Arc<Detector>,
    state: Arc<RwLock<DetectorState>>,
    lifecycle: Mutex<Lifecycle>,
    feed: RwLock<Option<LiveFeed>>,
    audit: Arc<dyn AuditSink>,
}

impl Controller {
    /// Create an idle controller
    ///
    /// # Arguments
    ///
    /// * `config` - Detection tunables, validated here
    /// * `audit` - Receives incidents as they are closed
    pub fn new(config: DetectionConfig, audit: Arc<dyn AuditSink>) -> Result<Self, ControllerError> {
        let state = DetectorState::new(&config);
        let detector = Detector::new(config).map_err(ControllerError::InvalidConfig)?;
        Ok(Self {
            detector: Arc::new(detector),
            state: Arc::new(RwLock::new(state)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            feed: RwLock::new(None),
            audit,
        })
    }

    pub fn config(&self) -> &DetectionConfig {
        self.detector.config()
    }

    /// Start a detection run.
    ///
    /// Fails with `AlreadyRunning` if a run is in progress, and with a
    /// source error if the replay log cannot be opened. The detector stays
    /// idle on failure.
    pub async fn start(&self, mode: DetectorMode) -> Result<(), ControllerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Running(worker) = &*lifecycle {
            warn!("Start rejected: detector already running in {} mode", worker.mode);
            return Err(ControllerError::AlreadyRunning);
        }

        let (source, feed) = match &mode {
            DetectorMode::Live => {
                let (feed, source) = live_channel(self.config().live_queue_capacity);
                (IngestionSource::Live(source), Some(feed))
            }
            DetectorMode::LogReplay { log_path } => match LogReplaySource::open(log_path).await {
                Ok(source) => (IngestionSource::LogReplay(source), None),
                Err(e) => {
                    warn!("Start rejected: {}", e);
                    return Err(e.into());
                }
            },
        };

        self.state.write().await.begin_run();
        *self.feed.write().await = feed;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_detection_loop(
            source,
            self.state.clone(),
            self.detector.clone(),
            self.audit.clone(),
            shutdown_rx,
        ));

        info!("Detector started in {} mode", mode);
        *lifecycle = Lifecycle::Running(Worker { mode, shutdown, handle });
        Ok(())
    }

    /// Stop the running detection loop and wait for it to exit.
    ///
    /// Active incidents are closed and handed to the audit sink. Returns
    /// `false` when the detector was already idle.
    pub async fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        let worker = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => {
                debug!("Stop requested while idle");
                return false;
            }
            Lifecycle::Running(worker) => worker,
        };

        *self.feed.write().await = None;
        let _ = worker.shutdown.send(true);
        if let Err(e) = worker.handle.await {
            error!("Detection loop ended abnormally: {}", e);
        }

        let closed = self.state.write().await.registry.close_all(Utc::now());
        for incident in &closed {
            self.audit.record(incident);
        }

        info!("Detector stopped ({} mode, {} incidents closed)", worker.mode.name(), closed.len());
        true
    }

    /// Stop the detector and wait for the audit sink to write out every
    /// incident closed so far
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(writer) = self.audit.close() {
            if let Err(e) = writer.await {
                error!("Audit writer ended abnormally: {}", e);
            }
        }
    }

    /// Current detections; the last known state when idle
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        let high_traffic = state.registry.active_ips(IncidentKind::Flood);
        let anomalous: Vec<IpAddr> = state
            .registry
            .active_ips(IncidentKind::Anomaly)
            .into_iter()
            .filter(|ip| !high_traffic.contains(ip))
            .collect();

        Snapshot {
            high_traffic_ips: ip_strings(high_traffic),
            anomalous_ips: ip_strings(anomalous),
            blocked_ips: ip_strings(state.registry.blocked_ips()),
            global_spike: state.global_spike,
        }
    }

    /// Lift the block on a source.
    ///
    /// Its active incidents are closed (history is kept) and its window
    /// counter is dropped, so a new block needs fresh evidence. Returns
    /// `false` without side effects when the source was not blocked.
    pub async fn unblock(&self, ip: IpAddr) -> bool {
        let closed = {
            let mut state = self.state.write().await;
            if !state.registry.unblock(&ip) {
                debug!("Unblock of {} ignored: not blocked", ip);
                return false;
            }
            state.stats.forget(&ip);
            state.registry.close_for_ip(&ip, Utc::now())
        };
        for incident in &closed {
            self.audit.record(incident);
        }
        monitoring::record_unblock();

        info!("Unblocked {}", ip);
        true
    }

    pub async fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.state.read().await.registry.is_blocked(ip)
    }

    pub async fn blocked(&self) -> Vec<BlockedEntry> {
        self.state.read().await.registry.list_blocked()
    }

    pub async fn incidents(&self, active_only: bool) -> Vec<Incident> {
        self.state.read().await.registry.list_incidents(active_only)
    }

    pub async fn counters(&self) -> Vec<WindowCounter> {
        self.state.read().await.stats.all_counters()
    }

    pub async fn status(&self) -> DetectorStatus {
        let (mode, log_path) = match &*self.lifecycle.lock().await {
            Lifecycle::Idle => (None, None),
            Lifecycle::Running(worker) => {
                let log_path = match &worker.mode {
                    DetectorMode::LogReplay { log_path } => Some(log_path.display().to_string()),
                    DetectorMode::Live => None,
                };
                (Some(worker.mode.name().to_string()), log_path)
            }
        };
        let state = self.state.read().await;

        DetectorStatus {
            running: mode.is_some(),
            mode,
            log_path,
            ticks: state.ticks,
            events_processed: state.events_processed,
            active_sources: state.stats.len(),
            last_tick: state.last_tick,
            source_exhausted: state.source_exhausted,
            global_spike: state.global_spike,
        }
    }

    /// Handle for pushing events into the running live detector
    pub async fn live_feed(&self) -> Option<LiveFeed> {
        self.feed.read().await.clone()
    }

    /// Queue live traffic for the next tick.
    ///
    /// Returns how many events were accepted; the rest were dropped because
    /// the queue was full.
    pub async fn ingest(&self, events: Vec<TrafficEvent>) -> Result<usize, ControllerError> {
        if let Some(feed) = self.feed.read().await.as_ref() {
            let accepted = events.into_iter().map(|event| feed.push(event)).filter(|ok| *ok).count();
            return Ok(accepted);
        }
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(worker) => Err(ControllerError::ModeMismatch(worker.mode.name().to_string())),
            Lifecycle::Idle => Err(ControllerError::NotRunning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{LogAuditSink, MockAuditSink};
    use mockall::Sequence;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fast_config() -> DetectionConfig {
        DetectionConfig { window_seconds: 2, tick_interval_ms: 20, flood_pps: 100.0, ..Default::default() }
    }

    fn controller(config: DetectionConfig) -> Controller {
        Controller::new(config, Arc::new(LogAuditSink)).unwrap()
    }

    async fn wait_for_exhausted(controller: &Controller) {
        for _ in 0..500 {
            if controller.status().await.source_exhausted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replay did not finish");
    }

    async fn wait_for_block(controller: &Controller, source: IpAddr) {
        for _ in 0..500 {
            if controller.is_blocked(&source).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was never blocked", source);
    }

    fn flood_log(source: &str, events: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..events {
            writeln!(file, "{:.3} {} 512", 1_000.0 + i as f64 / 1_000.0, source).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(DetectorMode::parse("live", None).unwrap(), DetectorMode::Live);
        assert_eq!(
            DetectorMode::parse("LOG", Some("/var/log/access.log")).unwrap(),
            DetectorMode::LogReplay { log_path: PathBuf::from("/var/log/access.log") }
        );
        assert!(matches!(DetectorMode::parse("log", None), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(DetectorMode::parse("log", Some("  ")), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(DetectorMode::parse("pcap", None), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = DetectionConfig { window_seconds: 0, ..Default::default() };
        assert!(matches!(Controller::new(config, Arc::new(LogAuditSink)), Err(ControllerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let controller = controller(fast_config());
        assert!(!controller.stop().await);
        assert!(!controller.stop().await);
        assert!(!controller.status().await.running);
        assert_eq!(controller.snapshot().await, Snapshot::default());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let controller = controller(fast_config());
        assert_ok!(controller.start(DetectorMode::Live).await);
        assert!(matches!(controller.start(DetectorMode::Live).await, Err(ControllerError::AlreadyRunning)));

        let status = controller.status().await;
        assert!(status.running);
        assert_eq!(status.mode.as_deref(), Some("live"));

        assert!(controller.stop().await);
        assert!(!controller.stop().await);
        assert!(!controller.status().await.running);
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_loop() {
        let controller = Arc::new(controller(fast_config()));
        let (a, b) = tokio::join!(controller.start(DetectorMode::Live), controller.start(DetectorMode::Live));

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(controller.stop().await);
    }

    #[tokio::test]
    async fn test_missing_log_rejects_start() {
        let controller = controller(fast_config());
        let mode = DetectorMode::LogReplay { log_path: PathBuf::from("/no/such/access.log") };

        assert!(matches!(controller.start(mode).await, Err(ControllerError::Source(SourceError::Open { .. }))));
        assert!(!controller.status().await.running);
        assert_ok!(controller.start(DetectorMode::Live).await);
        assert!(controller.stop().await);
    }

    #[tokio::test]
    async fn test_ingest_requires_live_run() {
        let controller = controller(fast_config());
        let event = TrafficEvent::new(ip("10.0.0.1"), Utc::now(), 64);
        assert!(matches!(controller.ingest(vec![event.clone()]).await, Err(ControllerError::NotRunning)));

        let log = flood_log("10.0.0.1", 10);
        controller.start(DetectorMode::LogReplay { log_path: log.path().to_path_buf() }).await.unwrap();
        assert!(matches!(controller.ingest(vec![event]).await, Err(ControllerError::ModeMismatch(_))));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_live_flood_is_blocked_and_unblocked() {
        let source = ip("10.0.0.5");
        let mut audit = MockAuditSink::new();
        audit
            .expect_record()
            .withf(move |incident| incident.source_ip == source && incident.kind == IncidentKind::Flood && !incident.active)
            .times(1)
            .return_const(());
        let controller = Controller::new(fast_config(), Arc::new(audit)).unwrap();
        controller.start(DetectorMode::Live).await.unwrap();

        let now = Utc::now();
        let events: Vec<TrafficEvent> = (0..500).map(|_| TrafficEvent::new(source, now, 64)).collect();
        assert_eq!(controller.ingest(events).await.unwrap(), 500);
        wait_for_block(&controller, source).await;

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.high_traffic_ips, vec!["10.0.0.5".to_string()]);
        assert_eq!(snapshot.blocked_ips, vec!["10.0.0.5".to_string()]);
        assert!(snapshot.anomalous_ips.is_empty());

        assert!(controller.unblock(source).await);
        assert!(!controller.unblock(source).await);
        assert!(!controller.is_blocked(&source).await);

        let history = controller.incidents(false).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source_ip, source);
        assert!(!history[0].active);

        assert!(controller.stop().await);
    }

    #[tokio::test]
    async fn test_stop_closes_incidents_and_keeps_blocks() {
        let mut audit = MockAuditSink::new();
        audit.expect_record().withf(|incident| incident.closed_at.is_some()).times(1).return_const(());
        let controller = Controller::new(fast_config(), Arc::new(audit)).unwrap();

        let log = flood_log("10.0.0.9", 400);
        controller.start(DetectorMode::LogReplay { log_path: log.path().to_path_buf() }).await.unwrap();
        wait_for_exhausted(&controller).await;

        let running = controller.snapshot().await;
        assert_eq!(running.high_traffic_ips, vec!["10.0.0.9".to_string()]);
        assert!(running.global_spike);

        assert!(controller.stop().await);
        let idle = controller.snapshot().await;
        assert!(idle.high_traffic_ips.is_empty());
        assert_eq!(idle.blocked_ips, vec!["10.0.0.9".to_string()]);
        assert!(idle.global_spike);
        assert_eq!(controller.incidents(false).await.len(), 1);
        assert_err!(controller.ingest(Vec::new()).await);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_audit_writer() {
        let written = Arc::new(AtomicBool::new(false));
        let flag = written.clone();
        let mut seq = Sequence::new();
        let mut audit = MockAuditSink::new();
        audit.expect_record().times(1).in_sequence(&mut seq).return_const(());
        audit.expect_close().times(1).in_sequence(&mut seq).returning(move || {
            let flag = flag.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            }))
        });
        let controller = Controller::new(fast_config(), Arc::new(audit)).unwrap();

        let log = flood_log("10.0.0.4", 400);
        controller.start(DetectorMode::LogReplay { log_path: log.path().to_path_buf() }).await.unwrap();
        wait_for_exhausted(&controller).await;

        controller.shutdown().await;
        assert!(written.load(Ordering::SeqCst));
        assert!(!controller.status().await.running);
    }
}
