//! Exporter configuration

use crate::{ExporterError, Result};
use accel_logwatch::TailerConfig;
use accel_telemetry::PollerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory where the device plugin records partition and device registrations
pub const DEFAULT_REGISTER_DIR: &str = "/run/metax/device-plugin/sgpu";

/// Top-level exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Address the HTTP endpoint binds to
    pub bind_address: String,

    /// HTTP port
    pub port: u16,

    /// Metric catalog CSV; the default search list is used when unset
    pub metric_catalog: Option<PathBuf>,

    /// Root under which log files and registrations are looked up
    pub mount_point: PathBuf,

    /// Device plugin registration directory
    pub register_dir: PathBuf,

    /// YAML pod-resource map; pods are not correlated when unset
    pub pod_resources: Option<PathBuf>,

    /// Explicit kernel log file relative to the mount point
    pub kernel_log: Option<PathBuf>,

    /// Explicit system log file relative to the mount point
    pub system_log: Option<PathBuf>,

    /// Collection settings
    pub poller: PollerConfig,

    /// Log tailing settings shared by both log sources
    pub tailer: TailerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread names in logs
    pub show_thread_names: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl ExporterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_metric_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.metric_catalog = Some(path.into());
        self
    }

    pub fn with_mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = path.into();
        self
    }

    pub fn with_register_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.register_dir = path.into();
        self
    }

    pub fn with_pod_resources(mut self, path: impl Into<PathBuf>) -> Self {
        self.pod_resources = Some(path.into());
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_tailer(mut self, tailer: TailerConfig) -> Self {
        self.tailer = tailer;
        self
    }

    /// Socket address string for the HTTP listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ExporterError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: ExporterConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(ExporterError::Config("Bind address cannot be empty".to_string()));
        }

        self.poller
            .validate()
            .map_err(|e| ExporterError::Config(format!("Poller config validation failed: {}", e)))?;

        self.tailer
            .validate()
            .map_err(|e| ExporterError::Config(format!("Tailer config validation failed: {}", e)))?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ExporterError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(ExporterError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            metric_catalog: None,
            mount_point: PathBuf::from("/"),
            register_dir: PathBuf::from(DEFAULT_REGISTER_DIR),
            pod_resources: None,
            kernel_log: None,
            system_log: None,
            poller: PollerConfig::default(),
            tailer: TailerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_names: true,
            show_line_numbers: false,
        }
    }
}
