use serde::{Deserialize, Serialize};
use crate::core::DetectionConfig;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Incident audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Redis connection URL; closed incidents only go to the log when unset
    pub redis_url: Option<String>,
    /// Redis list that closed incidents are appended to
    pub incidents_key: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            incidents_key: "detector:incidents".to_string(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether to expose Prometheus metrics at /metrics
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Detection configuration
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Audit configuration
    #[serde(default)]
    pub audit: AuditConfig,
    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            detection: DetectionConfig::default(),
            audit: AuditConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}
