//! Blocklist and incident registry.
//!
//! Incidents are never deleted. Clearing one (by unblock or detector stop)
//! marks it inactive and leaves it in the history. A block can only be
//! placed on an address that has a flood incident on record.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentKind {
    Flood,
    Anomaly,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::Flood => "flood",
            IncidentKind::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded classification of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub source_ip: IpAddr,
    pub kind: IncidentKind,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
    /// Highest rate observed while the incident was open (packets per second)
    pub peak_rate: f64,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A blocked source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub source_ip: IpAddr,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
}

/// Authoritative record of incidents and blocked sources
#[derive(Debug, Default, Clone)]
pub struct IncidentRegistry {
    incidents: Vec<Incident>,
    active: HashMap<(IpAddr, IncidentKind), usize>,
    blocked: BTreeMap<IpAddr, BlockedEntry>,
}

impl IncidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or refresh the active incident for `(ip, kind)`.
    ///
    /// Returns `true` when a new incident was opened.
    pub fn record(&mut self, ip: IpAddr, kind: IncidentKind, now: DateTime<Utc>, rate: f64) -> bool {
        if let Some(&index) = self.active.get(&(ip, kind)) {
            let incident = &mut self.incidents[index];
            if now > incident.last_seen {
                incident.last_seen = now;
            }
            incident.peak_rate = incident.peak_rate.max(rate);
            return false;
        }

        self.incidents.push(Incident {
            id: Uuid::new_v4(),
            source_ip: ip,
            kind,
            first_seen: now,
            last_seen: now,
            active: true,
            peak_rate: rate,
            closed_at: None,
        });
        self.active.insert((ip, kind), self.incidents.len() - 1);
        true
    }

    pub fn has_active(&self, ip: &IpAddr, kind: IncidentKind) -> bool {
        self.active.contains_key(&(*ip, kind))
    }

    /// Close the active incident for `(ip, kind)`, if any
    pub fn close(&mut self, ip: &IpAddr, kind: IncidentKind, now: DateTime<Utc>) -> Option<Incident> {
        let index = self.active.remove(&(*ip, kind))?;
        let incident = &mut self.incidents[index];
        incident.active = false;
        incident.closed_at = Some(now);
        Some(incident.clone())
    }

    /// Close every active incident of a source
    pub fn close_for_ip(&mut self, ip: &IpAddr, now: DateTime<Utc>) -> Vec<Incident> {
        [IncidentKind::Flood, IncidentKind::Anomaly]
            .into_iter()
            .filter_map(|kind| self.close(ip, kind, now))
            .collect()
    }

    /// Close every active incident
    pub fn close_all(&mut self, now: DateTime<Utc>) -> Vec<Incident> {
        let mut keys: Vec<(IpAddr, IncidentKind)> = self.active.keys().copied().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|(ip, kind)| self.close(&ip, kind, now))
            .collect()
    }

    /// Block a source that has a flood incident on record.
    ///
    /// Returns `true` when a new block was placed. Sources that are already
    /// blocked, or that never flooded, are left alone.
    pub fn block(&mut self, ip: IpAddr, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.blocked.contains_key(&ip) || !self.has_flood_history(&ip) {
            return false;
        }
        self.blocked.insert(ip, BlockedEntry { source_ip: ip, blocked_at: now, reason: reason.into() });
        true
    }

    /// Lift a block; unknown addresses are a no-op
    pub fn unblock(&mut self, ip: &IpAddr) -> bool {
        self.blocked.remove(ip).is_some()
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.blocked.contains_key(ip)
    }

    /// Blocked sources ordered by address
    pub fn list_blocked(&self) -> Vec<BlockedEntry> {
        self.blocked.values().cloned().collect()
    }

    /// Incidents in the order they were opened
    pub fn list_incidents(&self, active_only: bool) -> Vec<Incident> {
        self.incidents
            .iter()
            .filter(|incident| !active_only || incident.active)
            .cloned()
            .collect()
    }

    /// Sources with an active incident of `kind`, ordered by address
    pub fn active_ips(&self, kind: IncidentKind) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .active
            .keys()
            .filter(|(_, k)| *k == kind)
            .map(|(ip, _)| *ip)
            .collect();
        ips.sort();
        ips
    }

    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        self.blocked.keys().copied().collect()
    }

    fn has_flood_history(&self, ip: &IpAddr) -> bool {
        self.incidents
            .iter()
            .any(|incident| incident.source_ip == *ip && incident.kind == IncidentKind::Flood)
    }
}
