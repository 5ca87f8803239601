//! Monitoring for the detection service.
//!
//! This module records detection metrics through the `metrics` facade and
//! exposes them in Prometheus text format. Without an installed recorder
//! every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::core::detector::TickReport;
use crate::core::registry::IncidentKind;

/// Install the Prometheus recorder and register metric descriptions
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!("detector_ticks_total", "Detection ticks executed");
    describe_counter!("detector_events_total", "Traffic events processed");
    describe_counter!("detector_dropped_events_total", "Live events dropped on a full queue");
    describe_counter!("detector_incidents_opened_total", "Incidents opened, by kind");
    describe_counter!("detector_blocks_total", "Sources blocked");
    describe_counter!("detector_unblocks_total", "Sources unblocked");
    describe_gauge!("detector_active_sources", "Sources with traffic in the trailing window");
    describe_gauge!("detector_flooding_sources", "Active sources with an open flood incident");
    describe_gauge!("detector_global_spike", "1 while a global spike is in progress");

    Ok(handle)
}

pub fn record_tick(report: &TickReport) {
    counter!("detector_ticks_total", 1);
    counter!("detector_events_total", report.events as u64);
    for _ in &report.new_floods {
        counter!("detector_incidents_opened_total", 1, "kind" => IncidentKind::Flood.as_str());
    }
    for _ in &report.new_anomalies {
        counter!("detector_incidents_opened_total", 1, "kind" => IncidentKind::Anomaly.as_str());
    }
    counter!("detector_blocks_total", report.new_blocks.len() as u64);
    gauge!("detector_active_sources", report.total_sources as f64);
    gauge!("detector_flooding_sources", report.flooding_sources as f64);
    gauge!("detector_global_spike", if report.global_spike { 1.0 } else { 0.0 });
}

pub fn record_dropped_events(count: u64) {
    counter!("detector_dropped_events_total", count);
}

pub fn record_unblock() {
    counter!("detector_unblocks_total", 1);
}
