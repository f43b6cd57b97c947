//! # accel-exporter
//!
//! Prometheus exporter for accelerator telemetry.
//!
//! This crate joins the values collected by `accel-telemetry` and the log
//! records parsed by `accel-logwatch` with pod and topology labels, and
//! serves the result over HTTP.
//!
//! The pieces, leaves first:
//! - [`catalog`]: the CSV metric feed selecting exported families
//! - [`pods`]: pod-resource correlation
//! - [`labels`]: per-entity label tuples
//! - [`assembler`]: scrape-time assembly and text encoding
//! - [`endpoint`]: the axum application
//! - [`exporter`]: wiring of poller, tailers, assembler and endpoint

use thiserror::Error;

pub mod assembler;
pub mod catalog;
pub mod config;
pub mod endpoint;
pub mod exporter;
pub mod labels;
pub mod pods;

pub use assembler::{Assembler, LogFeeds};
pub use catalog::{MetricCatalog, MetricKind, MetricSpec};
pub use config::{ExporterConfig, LoggingConfig};
pub use endpoint::create_app;
pub use exporter::{host_name, Exporter, ExporterBuilder};
pub use labels::{fit_labels, LabelSets, MISSING_LABEL};
pub use pods::{FilePodResources, NoPodResources, PodInfo, PodResourceLookup, StaticPodResources};

/// Result type for exporter operations
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Errors that can occur while exporting metrics
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metric catalog error: {0}")]
    Catalog(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] accel_telemetry::TelemetryError),

    #[error("Log watch error: {0}")]
    LogWatch(#[from] accel_logwatch::LogWatchError),
}

impl ExporterError {
    /// Check if this error comes from user-supplied configuration
    pub fn is_configuration_issue(&self) -> bool {
        match self {
            ExporterError::Config(_) | ExporterError::Catalog(_) | ExporterError::Yaml(_) => true,
            ExporterError::Telemetry(e) => e.is_configuration_issue(),
            _ => false,
        }
    }
}

/// Initialize logging and tracing
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_names(logging_config.show_thread_names)
        .with_line_number(logging_config.show_line_numbers);

    let result = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    result.map_err(|e| ExporterError::Config(format!("Failed to initialize logging: {}", e)))
}
