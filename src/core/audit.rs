//! Audit trail for closed incidents.
//!
//! The controller hands every incident it closes (unblock, stop or
//! escalation) to an [`AuditSink`]. Recording never blocks the detector;
//! sinks that write in the background hand back their writer from
//! [`AuditSink::close`] so shutdown can wait for it.

use std::sync::{Mutex, PoisonError};

use log::{debug, error, info, warn};
use redis::AsyncCommands;
use redis::{Client as RedisClient, ErrorKind, RedisError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::registry::Incident;

/// Receives incidents once they are closed
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn record(&self, incident: &Incident);

    /// Stop accepting incidents.
    ///
    /// The returned task completes once everything recorded before the call
    /// has been written.
    fn close(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Writes closed incidents to the application log
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, incident: &Incident) {
        info!(
            "Incident closed: {} {} from {} to {} (peak {:.1} pps)",
            incident.kind, incident.source_ip, incident.first_seen, incident.last_seen, incident.peak_rate
        );
    }
}

/// Appends closed incidents as JSON to a Redis list
///
/// A single writer task owns the connection and pushes incidents in the
/// order they were recorded.
#[derive(Debug)]
pub struct RedisAuditSink {
    key: String,
    sender: Mutex<Option<mpsc::UnboundedSender<(Uuid, String)>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RedisAuditSink {
    /// Create a new Redis audit sink and start its writer
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL
    /// * `key` - List the incidents are pushed onto
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(url: &str, key: impl Into<String>) -> redis::RedisResult<Self> {
        let client = RedisClient::open(url)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| RedisError::from((ErrorKind::ClientError, "audit writer requires a tokio runtime")))?;

        let key = key.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = runtime.spawn(write_incidents(client, key.clone(), receiver));

        Ok(Self {
            key,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl AuditSink for RedisAuditSink {
    fn record(&self, incident: &Incident) {
        let payload = match serde_json::to_string(incident) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize incident {}: {}", incident.id, e);
                return;
            }
        };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match sender.as_ref() {
            Some(sender) => sender.send((incident.id, payload)).is_ok(),
            None => false,
        };
        if !sent {
            warn!("Audit sink closed, incident {} not written to Redis", incident.id);
        }
    }

    fn close(&self) -> Option<JoinHandle<()>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Push incidents onto `key` until every sender is gone
async fn write_incidents(client: RedisClient, key: String, mut incidents: mpsc::UnboundedReceiver<(Uuid, String)>) {
    let mut conn = None;
    while let Some((id, payload)) = incidents.recv().await {
        if conn.is_none() {
            match client.get_async_connection().await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    error!("Redis connection error while auditing incident {}: {}", id, e);
                    continue;
                }
            }
        }
        if let Some(c) = conn.as_mut() {
            let result: redis::RedisResult<()> = c.rpush(&key, payload).await;
            if let Err(e) = result {
                error!("Failed to append incident {} to {}: {}", id, key, e);
                conn = None;
            }
        }
    }
    debug!("Audit writer for {} finished", key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::IncidentKind;
    use chrono::Utc;
    use std::time::Duration;

    fn closed_incident() -> Incident {
        Incident {
            id: Uuid::new_v4(),
            source_ip: "10.0.0.5".parse().unwrap(),
            kind: IncidentKind::Flood,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            active: false,
            peak_rate: 1500.0,
            closed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_redis_sink_needs_runtime() {
        assert!(RedisAuditSink::new("redis://127.0.0.1:6379", "detector:incidents").is_err());
    }

    #[tokio::test]
    async fn test_redis_sink_rejects_bad_url() {
        assert!(RedisAuditSink::new("not a url", "detector:incidents").is_err());
        let sink = RedisAuditSink::new("redis://127.0.0.1:6379", "detector:incidents").unwrap();
        assert_eq!(sink.key(), "detector:incidents");
        assert!(sink.close().is_some());
    }

    #[tokio::test]
    async fn test_close_hands_back_writer_once() {
        let sink = RedisAuditSink::new("redis://127.0.0.1:1/", "detector:incidents").unwrap();
        sink.record(&closed_incident());

        let writer = sink.close().unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(10), writer).await;
        assert!(matches!(finished, Ok(Ok(()))));

        assert!(sink.close().is_none());
        // recording after close is dropped with a warning
        sink.record(&closed_incident());
    }

    #[test]
    fn test_log_sink_has_no_writer() {
        let sink = LogAuditSink;
        sink.record(&closed_incident());
        assert!(sink.close().is_none());
    }
}
