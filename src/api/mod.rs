//! API endpoints for the detection service.
//!
//! This module provides HTTP endpoints for controlling the detector and
//! polling its findings. Callers are assumed to be authorized already.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::{Controller, ControllerError, DetectorMode, TrafficEvent};
use crate::models::Config;
use crate::utils::timestamp_or_now;

pub struct ApiState {
    pub controller: Arc<Controller>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/metrics").route(web::get().to(metrics)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/health").route(web::get().to(health_check)))
                .service(
                    web::scope("/detector")
                        .service(web::resource("/start").route(web::post().to(start_detector)))
                        .service(web::resource("/stop").route(web::post().to(stop_detector)))
                        .service(web::resource("/incidents").route(web::get().to(incidents)))
                        .service(web::resource("/unblock").route(web::post().to(unblock)))
                        .service(web::resource("/status").route(web::get().to(status)))
                        .service(web::resource("/history").route(web::get().to(history)))
                        .service(web::resource("/counters").route(web::get().to(counters)))
                        .service(web::resource("/blocked").route(web::get().to(blocked)))
                        .service(web::resource("/blocked/{ip}").route(web::get().to(blocked_ip)))
                        .service(web::resource("/traffic").route(web::post().to(ingest_traffic)))
                        .service(web::resource("/config").route(web::get().to(detection_config))),
                ),
        );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Generic status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn new(status: impl Into<String>) -> Self {
        Self { status: status.into() }
    }
}

/// Detector start request
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub mode: String,
    pub log_path: Option<String>,
}

/// Unblock request
#[derive(Debug, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub active_only: bool,
}

/// One observed packet or request submitted to the live detector
#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub source_ip: IpAddr,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
}

/// Live traffic submission
#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficRequest {
    pub events: Vec<TrafficRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficResponse {
    pub accepted: usize,
}

#[derive(Serialize)]
struct BlockedResponse {
    ip: String,
    blocked: bool,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn error_response(error: &ControllerError) -> HttpResponse {
    let body = StatusResponse::new(format!("error: {}", error));
    match error {
        ControllerError::InvalidConfig(_) | ControllerError::Source(_) => HttpResponse::BadRequest().json(body),
        ControllerError::AlreadyRunning | ControllerError::NotRunning | ControllerError::ModeMismatch(_) => {
            HttpResponse::Conflict().json(body)
        }
    }
}

/// Start the detector in live or log replay mode
pub async fn start_detector(state: web::Data<ApiState>, req: web::Json<StartRequest>) -> impl Responder {
    let mode = match DetectorMode::parse(&req.mode, req.log_path.as_deref()) {
        Ok(mode) => mode,
        Err(e) => return error_response(&e),
    };
    match state.controller.start(mode).await {
        Ok(()) => HttpResponse::Ok().json(StatusResponse::new("started")),
        Err(e) => error_response(&e),
    }
}

/// Stop the detector; stopping an idle detector succeeds
pub async fn stop_detector(state: web::Data<ApiState>) -> impl Responder {
    let status = if state.controller.stop().await { "stopped" } else { "not running" };
    HttpResponse::Ok().json(StatusResponse::new(status))
}

/// Current detections, polled by the UI
pub async fn incidents(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.snapshot().await)
}

/// Lift a block
pub async fn unblock(state: web::Data<ApiState>, req: web::Json<UnblockRequest>) -> impl Responder {
    let ip: IpAddr = match req.ip.trim().parse() {
        Ok(ip) => ip,
        Err(_) => return HttpResponse::BadRequest().json(StatusResponse::new(format!("error: invalid ip '{}'", req.ip))),
    };
    let status = if state.controller.unblock(ip).await { "unblocked" } else { "not blocked" };
    HttpResponse::Ok().json(StatusResponse::new(status))
}

pub async fn status(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.status().await)
}

pub async fn history(state: web::Data<ApiState>, query: web::Query<HistoryQuery>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.incidents(query.active_only).await)
}

pub async fn counters(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.counters().await)
}

pub async fn blocked(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.blocked().await)
}

pub async fn blocked_ip(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let raw = path.into_inner();
    match raw.parse::<IpAddr>() {
        Ok(ip) => HttpResponse::Ok().json(BlockedResponse {
            ip: ip.to_string(),
            blocked: state.controller.is_blocked(&ip).await,
        }),
        Err(_) => HttpResponse::BadRequest().json(StatusResponse::new(format!("error: invalid ip '{}'", raw))),
    }
}

/// Feed observed traffic to a live detector run
pub async fn ingest_traffic(state: web::Data<ApiState>, req: web::Json<TrafficRequest>) -> impl Responder {
    let events = req
        .into_inner()
        .events
        .into_iter()
        .map(|record| TrafficEvent::new(record.source_ip, timestamp_or_now(record.timestamp), record.size))
        .collect();
    match state.controller.ingest(events).await {
        Ok(accepted) => HttpResponse::Ok().json(TrafficResponse { accepted }),
        Err(e) => error_response(&e),
    }
}

/// Effective detection settings
pub async fn detection_config(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.controller.config())
}

/// Prometheus metrics endpoint
async fn metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}
