//! DoS Detection Service
//!
//! This is the main entry point for the detection service.
//! It initializes the application components and starts the web server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};

use dos_detection_service::api::{self, ApiState};
use dos_detection_service::config;
use dos_detection_service::core::{monitoring, AuditSink, Controller, LogAuditSink, RedisAuditSink};
use dos_detection_service::models::Config;

fn audit_sink(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    match &config.audit.redis_url {
        Some(url) => {
            let sink = RedisAuditSink::new(url, config.audit.incidents_key.clone())
                .context("Failed to create Redis client")?;
            info!("Recording closed incidents to Redis list {}", sink.key());
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogAuditSink)),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting DoS Detection Service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;
    let config = Arc::new(config);

    let metrics = if config.monitoring.enabled {
        match monitoring::install_prometheus() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus exporter unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let controller = Controller::new(config.detection.clone(), audit_sink(&config)?)
        .context("Invalid detection configuration")?;
    let controller = Arc::new(controller);

    // Create API state
    let state = web::Data::new(ApiState {
        controller: controller.clone(),
        config: config.clone(),
        metrics,
    });

    info!("Listening on {}:{}", config.server.host, config.server.port);

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    controller.shutdown().await;
    info!("DoS Detection Service stopped");
    Ok(())
}
