//! Traffic ingestion for the detection loop.
//!
//! Events come from exactly one of two places: a live in-process feed that
//! the host pushes observed traffic into, or the replay of a stored access
//! log. Both are exposed through [`IngestionSource`], which the detection
//! loop drains once per tick.
//!
//! Log replay runs as fast as possible on a logical clock taken from the
//! recorded timestamps, so replaying the same file twice always produces the
//! same ticks.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::core::monitoring;

/// Errors that can occur while ingesting traffic
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read log {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("live feed closed")]
    FeedClosed,
}

impl SourceError {
    /// Whether the loop should keep going after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::FeedClosed)
    }
}

/// A single observed packet or request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEvent {
    pub source_ip: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

impl TrafficEvent {
    pub fn new(source_ip: IpAddr, timestamp: DateTime<Utc>, size: u64) -> Self {
        Self { source_ip, timestamp, size }
    }
}

/// Result of asking a source for its next event
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    Event(TrafficEvent),
    /// Nothing available right now, try again next tick
    Pending,
    EndOfStream,
}

/// How the detection loop should pace ticks for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Tick on the wall clock at the configured interval
    WallClock,
    /// Tick back to back, time comes from the events themselves
    AsFastAsPossible,
}

/// The events for one tick and the instant the tick represents
#[derive(Debug, Clone)]
pub struct Batch {
    pub events: Vec<TrafficEvent>,
    pub now: DateTime<Utc>,
    /// True once the source will never yield another event
    pub exhausted: bool,
}

/// Producer handle for the live source.
///
/// Cloneable; every clone feeds the same running detector.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    sender: mpsc::Sender<TrafficEvent>,
}

impl LiveFeed {
    /// Queue an event without waiting.
    ///
    /// Returns `false` when the queue is full or the detector has stopped;
    /// the event is dropped in that case.
    pub fn push(&self, event: TrafficEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                monitoring::record_dropped_events(1);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create a connected live feed and source
pub fn live_channel(capacity: usize) -> (LiveFeed, LiveSource) {
    let (sender, receiver) = mpsc::channel(capacity);
    (LiveFeed { sender }, LiveSource { receiver })
}

/// Consumer side of the live feed
#[derive(Debug)]
pub struct LiveSource {
    receiver: mpsc::Receiver<TrafficEvent>,
}

impl LiveSource {
    pub fn next(&mut self) -> Result<Ingest, SourceError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Ingest::Event(event)),
            Err(TryRecvError::Empty) => Ok(Ingest::Pending),
            Err(TryRecvError::Disconnected) => Err(SourceError::FeedClosed),
        }
    }

    /// Take whatever is queued, up to `max_events`, without blocking
    pub fn drain(&mut self, max_events: usize) -> Result<Batch, SourceError> {
        let mut events = Vec::new();
        while events.len() < max_events {
            match self.next() {
                Ok(Ingest::Event(event)) => events.push(event),
                Ok(_) => break,
                Err(e) if events.is_empty() => return Err(e),
                Err(_) => break,
            }
        }
        Ok(Batch { events, now: Utc::now(), exhausted: false })
    }
}

/// Replays a stored access log in file order
pub struct LogReplaySource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    pending: Option<TrafficEvent>,
    clock: Option<DateTime<Utc>>,
    previous: DateTime<Utc>,
    line_no: u64,
    skipped: u64,
    finished: bool,
}

impl LogReplaySource {
    /// Open a log for replay.
    ///
    /// Fails immediately when the path is missing, unreadable or a directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|source| SourceError::Open { path: path.clone(), source })?;
        let metadata = file
            .metadata()
            .await
            .map_err(|source| SourceError::Open { path: path.clone(), source })?;
        if metadata.is_dir() {
            return Err(SourceError::Open {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is a directory"),
            });
        }

        info!("Opened {} for replay", path.display());
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            pending: None,
            clock: None,
            previous: DateTime::<Utc>::UNIX_EPOCH,
            line_no: 0,
            skipped: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines that could not be turned into an event
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }

    pub async fn next(&mut self) -> Result<Ingest, SourceError> {
        if let Some(event) = self.pending.take() {
            return Ok(Ingest::Event(event));
        }
        if self.finished {
            return Ok(Ingest::EndOfStream);
        }
        match self.read_event().await? {
            Some(event) => Ok(Ingest::Event(event)),
            None => {
                self.finished = true;
                Ok(Ingest::EndOfStream)
            }
        }
    }

    /// Take every event that falls inside the next `step` of log time.
    ///
    /// The batch's `now` is the end of that step. Stretches of the log with
    /// no events are skipped rather than ticked through.
    pub async fn drain(&mut self, step: chrono::Duration, max_events: usize) -> Result<Batch, SourceError> {
        if self.pending.is_none() && !self.finished {
            self.advance().await;
        }
        let start = match (&self.pending, self.clock) {
            (None, clock) => {
                return Ok(Batch {
                    events: Vec::new(),
                    now: clock.unwrap_or(self.previous),
                    exhausted: true,
                });
            }
            (Some(next), Some(clock)) if next.timestamp < clock + step => clock,
            (Some(next), _) => next.timestamp,
        };
        let horizon = start + step;

        let mut events = Vec::new();
        let mut truncated = false;
        loop {
            match self.pending.take() {
                Some(event) if event.timestamp < horizon => {
                    if events.len() >= max_events {
                        self.pending = Some(event);
                        truncated = true;
                        break;
                    }
                    events.push(event);
                    self.advance().await;
                }
                other => {
                    self.pending = other;
                    break;
                }
            }
        }

        self.clock = Some(if truncated { start } else { horizon });
        Ok(Batch {
            events,
            now: horizon,
            exhausted: self.pending.is_none() && self.finished,
        })
    }

    /// Load the next event into `pending`; a read failure ends the replay
    async fn advance(&mut self) {
        match self.read_event().await {
            Ok(Some(event)) => self.pending = Some(event),
            Ok(None) => self.finished = true,
            Err(e) => {
                error!("Replay of {} stopped at line {}: {}", self.path.display(), self.line_no, e);
                self.finished = true;
            }
        }
    }

    async fn read_event(&mut self) -> Result<Option<TrafficEvent>, SourceError> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .map_err(|source| SourceError::Read { path: self.path.clone(), source })?
        {
            self.line_no += 1;
            match parse_log_line(&line, self.previous) {
                ParsedLine::Record(event) => {
                    self.previous = event.timestamp;
                    return Ok(Some(event));
                }
                ParsedLine::Ignored => {}
                ParsedLine::Malformed => {
                    self.skipped += 1;
                    debug!("Skipping malformed line {} of {}", self.line_no, self.path.display());
                }
            }
        }
        Ok(None)
    }
}

/// Where the detection loop gets its traffic
pub enum IngestionSource {
    Live(LiveSource),
    LogReplay(LogReplaySource),
}

impl IngestionSource {
    pub async fn next(&mut self) -> Result<Ingest, SourceError> {
        match self {
            IngestionSource::Live(source) => source.next(),
            IngestionSource::LogReplay(source) => source.next().await,
        }
    }

    /// Collect the events for one tick
    pub async fn drain(&mut self, step: chrono::Duration, max_events: usize) -> Result<Batch, SourceError> {
        match self {
            IngestionSource::Live(source) => source.drain(max_events),
            IngestionSource::LogReplay(source) => source.drain(step, max_events).await,
        }
    }

    pub fn pacing(&self) -> Pacing {
        match self {
            IngestionSource::Live(_) => Pacing::WallClock,
            IngestionSource::LogReplay(_) => Pacing::AsFastAsPossible,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            IngestionSource::Live(_) => "live feed".to_string(),
            IngestionSource::LogReplay(source) => format!("replay of {}", source.path().display()),
        }
    }
}

#[derive(Debug, PartialEq)]
enum ParsedLine {
    Record(TrafficEvent),
    Ignored,
    Malformed,
}

/// Parse one access log line.
///
/// Accepts Common Log Format as well as simple `timestamp ip bytes` records
/// separated by whitespace or commas. Lines without a timestamp inherit
/// `fallback`, the timestamp of the previous record.
fn parse_log_line(line: &str, fallback: DateTime<Utc>) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return ParsedLine::Ignored;
    }

    let (bracketed, rest) = extract_bracketed_timestamp(trimmed);
    let fields: Vec<&str> = rest
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|field| !field.is_empty())
        .collect();

    let Some((ip_index, source_ip)) = fields
        .iter()
        .enumerate()
        .find_map(|(i, field)| field.parse::<IpAddr>().ok().map(|ip| (i, ip)))
    else {
        return ParsedLine::Malformed;
    };

    let mut timestamp_index = None;
    let timestamp = match bracketed {
        Some(ts) => ts,
        None => match fields.first().and_then(|field| parse_leading_timestamp(field)) {
            Some(ts) if ip_index != 0 => {
                timestamp_index = Some(0);
                ts
            }
            _ => fallback,
        },
    };

    let last = fields.len() - 1;
    let size = if last != ip_index && Some(last) != timestamp_index {
        fields[last].parse::<u64>().unwrap_or(0)
    } else {
        0
    };

    ParsedLine::Record(TrafficEvent::new(source_ip, timestamp, size))
}

/// Pull a `[10/Oct/2000:13:55:36 -0700]` date out of the line
fn extract_bracketed_timestamp(line: &str) -> (Option<DateTime<Utc>>, String) {
    if let (Some(open), Some(close)) = (line.find('['), line.find(']')) {
        if open < close {
            let inner = &line[open + 1..close];
            if let Ok(ts) = DateTime::parse_from_str(inner, "%d/%b/%Y:%H:%M:%S %z") {
                let rest = format!("{} {}", &line[..open], &line[close + 1..]);
                return (Some(ts.with_timezone(&Utc)), rest);
            }
        }
    }
    (None, line.to_string())
}

fn parse_leading_timestamp(field: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(field) {
        return Some(ts.with_timezone(&Utc));
    }
    let seconds = field.parse::<f64>().ok().filter(|s| s.is_finite() && *s >= 0.0)?;
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn write_log(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_common_log_format() {
        let line = r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326"#;
        match parse_log_line(line, epoch()) {
            ParsedLine::Record(event) => {
                assert_eq!(event.source_ip, ip("127.0.0.1"));
                assert_eq!(event.size, 2326);
                assert_eq!(event.timestamp.to_rfc3339(), "2000-10-10T20:55:36+00:00");
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_records() {
        let ParsedLine::Record(event) = parse_log_line("1700000000.5 10.0.0.5 1500", epoch()) else {
            panic!("expected a record");
        };
        assert_eq!(event.source_ip, ip("10.0.0.5"));
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(event.size, 1500);

        let ParsedLine::Record(event) = parse_log_line("2024-05-01T10:00:00Z,192.168.1.9,64", epoch()) else {
            panic!("expected a record");
        };
        assert_eq!(event.source_ip, ip("192.168.1.9"));
        assert_eq!(event.size, 64);
    }

    #[test]
    fn test_parse_inherits_previous_timestamp() {
        let previous = Utc.timestamp_opt(1_000, 0).unwrap();
        let ParsedLine::Record(event) = parse_log_line("10.1.1.1", previous) else {
            panic!("expected a record");
        };
        assert_eq!(event.timestamp, previous);
        assert_eq!(event.size, 0);
    }

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        assert_eq!(parse_log_line("   ", epoch()), ParsedLine::Ignored);
        assert_eq!(parse_log_line("# header", epoch()), ParsedLine::Ignored);
        assert_eq!(parse_log_line("no address here 200", epoch()), ParsedLine::Malformed);
    }

    #[test]
    fn test_live_drain_is_bounded() {
        let (feed, mut source) = live_channel(16);
        for i in 0..5 {
            assert!(feed.push(TrafficEvent::new(ip("10.0.0.1"), Utc::now(), i)));
        }

        let batch = source.drain(3).unwrap();
        assert_eq!(batch.events.len(), 3);
        let batch = source.drain(3).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(source.next().unwrap(), Ingest::Pending);

        drop(feed);
        assert!(matches!(source.drain(3), Err(SourceError::FeedClosed)));
    }

    #[test]
    fn test_live_feed_drops_when_full() {
        let (feed, _source) = live_channel(1);
        assert!(feed.push(TrafficEvent::new(ip("10.0.0.1"), Utc::now(), 1)));
        assert!(!feed.push(TrafficEvent::new(ip("10.0.0.1"), Utc::now(), 1)));
    }

    #[tokio::test]
    async fn test_open_missing_log_fails() {
        let result = LogReplaySource::open("/definitely/not/here.log").await;
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[tokio::test]
    async fn test_replay_drains_by_log_time() {
        let log = write_log(&[
            "# t ip bytes",
            "100 10.0.0.1 10",
            "100.5 10.0.0.2 10",
            "101.2 10.0.0.1 10",
            "250 10.0.0.3 10",
        ]);
        let mut source = LogReplaySource::open(log.path()).await.unwrap();
        let step = chrono::Duration::seconds(1);

        let batch = source.drain(step, 100).await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.now.timestamp(), 101);
        assert!(!batch.exhausted);

        let batch = source.drain(step, 100).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.now.timestamp(), 102);

        // the gap up to t=250 is skipped in one step
        let batch = source.drain(step, 100).await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.now.timestamp(), 251);
        assert!(batch.exhausted);

        assert_eq!(source.next().await.unwrap(), Ingest::EndOfStream);
    }

    #[tokio::test]
    async fn test_replay_respects_max_events() {
        let log = write_log(&["5 10.0.0.1", "5 10.0.0.1", "5 10.0.0.1"]);
        let mut source = LogReplaySource::open(log.path()).await.unwrap();
        let step = chrono::Duration::seconds(1);

        let first = source.drain(step, 2).await.unwrap();
        let second = source.drain(step, 2).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(second.events.len(), 1);
        assert_eq!(first.now, second.now);
        assert!(second.exhausted);
    }
}
