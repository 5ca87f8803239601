//! Configuration management for the detection service.
//!
//! This module handles loading and managing application configuration
//! from configuration files and environment variables.

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the config file and environment variables.
///
/// `CONFIG_FILE` names the file (default `config/default.toml`, optional).
/// Variables such as `DETECTOR__DETECTION__FLOOD_PPS` override file values.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("detection.window_seconds", 10)?
        .set_default("detection.tick_interval_ms", 1000)?
        .set_default("detection.flood_pps", 1000.0)?
        .set_default("audit.incidents_key", "detector:incidents")?
        .set_default("monitoring.enabled", true)?
        .add_source(File::with_name(&config_file).required(false))
        .add_source(
            Environment::with_prefix("DETECTOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}
