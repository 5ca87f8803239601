use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Render addresses for JSON responses, keeping their order
pub fn ip_strings<I: IntoIterator<Item = IpAddr>>(ips: I) -> Vec<String> {
    ips.into_iter().map(|ip| ip.to_string()).collect()
}

/// Resolve an optional client supplied timestamp against the current time
pub fn timestamp_or_now(timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
    timestamp.unwrap_or_else(Utc::now)
}
