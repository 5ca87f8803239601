//! Per-source traffic statistics over a rolling window.
//!
//! Every source IP keeps per-second buckets covering the trailing window;
//! their sum is the rate the detector classifies on. Separately, the window
//! length also tumbles into baseline periods: when a period closes its rate
//! is pushed onto a short history that serves as the source's own baseline
//! for anomaly classification.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::source::TrafficEvent;
use crate::core::DetectionConfig;

/// Traffic counters for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub source_ip: IpAddr,
    /// Start of the current baseline period
    pub window_start: DateTime<Utc>,
    /// Packets seen over the trailing window
    pub packet_count: u64,
    /// Bytes seen over the trailing window
    pub byte_count: u64,
    pub last_seen: DateTime<Utc>,
    /// Rates of the most recent completed periods, oldest first
    pub history: VecDeque<f64>,
    /// Consecutive completed periods without traffic
    pub idle_windows: u32,
    #[serde(skip)]
    period_packets: u64,
    #[serde(skip)]
    buckets: VecDeque<Bucket>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bucket {
    second: i64,
    packets: u64,
    bytes: u64,
}

impl WindowCounter {
    fn new(source_ip: IpAddr, start: DateTime<Utc>) -> Self {
        Self {
            source_ip,
            window_start: start,
            packet_count: 0,
            byte_count: 0,
            last_seen: start,
            history: VecDeque::new(),
            idle_windows: 0,
            period_packets: 0,
            buckets: VecDeque::new(),
        }
    }

    /// Packets per second over the trailing window
    pub fn rate(&self, window: Duration) -> f64 {
        self.packet_count as f64 / seconds(window)
    }

    /// Whether the source sent anything within the trailing window
    pub fn is_active(&self) -> bool {
        self.packet_count > 0
    }

    /// Mean rate of the completed periods on record
    pub fn baseline(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }

    fn add(&mut self, timestamp: DateTime<Utc>, size: u64) {
        let second = timestamp.timestamp();
        match self.buckets.iter().rposition(|b| b.second <= second) {
            Some(i) if self.buckets[i].second == second => {
                let bucket = &mut self.buckets[i];
                bucket.packets += 1;
                bucket.bytes = bucket.bytes.saturating_add(size);
            }
            position => {
                let at = position.map_or(0, |i| i + 1);
                self.buckets.insert(at, Bucket { second, packets: 1, bytes: size });
            }
        }
        self.packet_count += 1;
        self.byte_count = self.byte_count.saturating_add(size);
        self.period_packets += 1;
    }

    /// Drop buckets older than the `window_secs` seconds that end at `end` (exclusive)
    fn slide(&mut self, end: i64, window_secs: i64) {
        let cutoff = end - window_secs;
        while let Some(front) = self.buckets.front() {
            if front.second >= cutoff {
                break;
            }
            self.packet_count -= front.packets;
            self.byte_count -= front.bytes;
            self.buckets.pop_front();
        }
    }

    /// Close the current baseline period if `now` is past its end.
    ///
    /// Periods that elapsed entirely without traffic count as zero-rate
    /// history and as idle periods.
    fn roll(&mut self, now: DateTime<Utc>, window: Duration, keep: usize) -> bool {
        let elapsed = now - self.window_start;
        if elapsed < window {
            return false;
        }
        let window_ms = window.num_milliseconds().max(1);
        let windows = (elapsed.num_milliseconds() / window_ms).max(1);

        let completed = self.period_packets as f64 / seconds(window);
        self.push_history(completed, keep);
        let empty = (windows - 1).min(keep as i64);
        for _ in 0..empty {
            self.push_history(0.0, keep);
        }

        let idle = u32::try_from(windows - 1).unwrap_or(u32::MAX);
        self.idle_windows = if self.period_packets == 0 {
            self.idle_windows.saturating_add(idle).saturating_add(1)
        } else {
            idle
        };
        self.period_packets = 0;
        self.window_start = self.window_start + Duration::milliseconds(window_ms * windows);
        true
    }

    fn push_history(&mut self, rate: f64, keep: usize) {
        self.history.push_back(rate);
        while self.history.len() > keep {
            self.history.pop_front();
        }
    }
}

/// Rolling window counters for every observed source
#[derive(Debug, Clone)]
pub struct WindowStats {
    counters: HashMap<IpAddr, WindowCounter>,
    window: Duration,
    window_secs: i64,
    baseline_windows: usize,
    evict_after: u32,
}

impl WindowStats {
    /// Create an empty store
    ///
    /// # Arguments
    ///
    /// * `window` - Length of the trailing window, rounded up to whole seconds
    /// * `baseline_windows` - Completed periods kept per source
    /// * `evict_after` - Empty periods after which a source is dropped (at least 1)
    pub fn new(window: Duration, baseline_windows: usize, evict_after: u32) -> Self {
        let window_secs = ((window.num_milliseconds() + 999) / 1000).max(1);
        Self {
            counters: HashMap::new(),
            window: Duration::seconds(window_secs),
            window_secs,
            baseline_windows: baseline_windows.max(1),
            evict_after: evict_after.max(1),
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.window(), config.baseline_windows, config.evict_after_windows)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count an event against its source
    pub fn record(&mut self, event: &TrafficEvent) {
        let window_secs = self.window_secs;
        let counter = self
            .counters
            .entry(event.source_ip)
            .or_insert_with(|| WindowCounter::new(event.source_ip, event.timestamp));
        counter.roll(event.timestamp, self.window, self.baseline_windows);

        counter.add(event.timestamp, event.size);
        if let Some(newest) = counter.buckets.back().map(|b| b.second) {
            counter.slide(newest + 1, window_secs);
        }
        if event.timestamp > counter.last_seen {
            counter.last_seen = event.timestamp;
        }
        counter.idle_windows = 0;
    }

    /// Move every trailing window so it ends at `now`
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let end = window_end(now);
        let window_secs = self.window_secs;
        for counter in self.counters.values_mut() {
            counter.slide(end, window_secs);
        }
    }

    /// Packets per second for a source, zero when it is not tracked
    pub fn rate(&self, ip: &IpAddr) -> f64 {
        self.counters.get(ip).map(|c| c.rate(self.window)).unwrap_or(0.0)
    }

    pub fn baseline(&self, ip: &IpAddr) -> Option<f64> {
        self.counters.get(ip).and_then(WindowCounter::baseline)
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&WindowCounter> {
        self.counters.get(ip)
    }

    /// Copy of every counter, ordered by source address
    pub fn all_counters(&self) -> Vec<WindowCounter> {
        let mut counters: Vec<WindowCounter> = self.counters.values().cloned().collect();
        counters.sort_by_key(|c| c.source_ip);
        counters
    }

    /// Current rate of every source with traffic in its trailing window
    pub fn active_rates(&self) -> impl Iterator<Item = (IpAddr, f64)> + '_ {
        self.counters
            .iter()
            .filter(|(_, c)| c.is_active())
            .map(move |(ip, c)| (*ip, c.rate(self.window)))
    }

    /// Slide every window to `now`, close elapsed periods and evict
    /// sources idle for too long.
    ///
    /// Returns the number of evicted sources.
    pub fn maintain(&mut self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        let window_secs = self.window_secs;
        let end = window_end(now);
        let keep = self.baseline_windows;
        let evict_after = self.evict_after;
        let before = self.counters.len();

        self.counters.retain(|_, counter| {
            counter.roll(now, window, keep);
            counter.slide(end, window_secs);
            counter.idle_windows < evict_after
        });
        before - self.counters.len()
    }

    /// Drop everything known about a source
    pub fn forget(&mut self, ip: &IpAddr) -> bool {
        self.counters.remove(ip).is_some()
    }

    pub fn clear(&mut self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Exclusive end, in whole seconds, of a trailing window that closes at `now`
fn window_end(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    if now.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn seconds(window: Duration) -> f64 {
    (window.num_milliseconds().max(1) as f64) / 1000.0
}
