//! Accelerator exporter daemon

use accel_exporter::{init_logging, ExporterBuilder, ExporterConfig};
use accel_telemetry::DeviceLibrary;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "accel-exporter")]
#[command(about = "Prometheus exporter for accelerator telemetry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// HTTP port [default: 8000]
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Collection interval in milliseconds [default: 10000]
    #[arg(short, long, value_name = "MS")]
    interval: Option<u64>,

    /// Metric catalog CSV
    #[arg(short = 'c', long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Root under which host logs and registrations are mounted [default: /]
    #[arg(short, long, value_name = "DIR")]
    mount_point: Option<PathBuf>,

    /// Exporter settings file (YAML)
    #[arg(short, long, value_name = "FILE", env = "ACCEL_EXPORTER_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Simulate this many devices instead of loading the device library
    #[cfg(feature = "mock")]
    #[arg(long, value_name = "COUNT")]
    mock_devices: Option<u32>,
}

impl Cli {
    fn load_config(&self) -> Result<ExporterConfig> {
        let mut config = match &self.settings {
            Some(path) => ExporterConfig::from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => ExporterConfig::default(),
        };

        // Apply CLI overrides
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(interval) = self.interval {
            config.poller.interval = Duration::from_millis(interval);
        }
        if let Some(ref catalog) = self.config_file {
            config.metric_catalog = Some(catalog.clone());
        }
        if let Some(ref mount_point) = self.mount_point {
            config.mount_point = mount_point.clone();
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref format) = self.log_format {
            config.logging.format = format.clone();
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    #[cfg(feature = "mock")]
    fn library(&self) -> Arc<dyn DeviceLibrary> {
        match self.mock_devices {
            Some(count) => {
                info!("Simulating {} devices", count);
                Arc::new(accel_telemetry::mock::MockLibrary::new(count, 1))
            }
            None => Arc::new(accel_telemetry::UnloadedLibrary),
        }
    }

    #[cfg(not(feature = "mock"))]
    fn library(&self) -> Arc<dyn DeviceLibrary> {
        Arc::new(accel_telemetry::UnloadedLibrary)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_logging(&config.logging)?;

    info!(
        "Starting accel-exporter {} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_address()
    );

    let builder = ExporterBuilder::new()
        .with_config(config)
        .with_library(cli.library());
    let mut exporter = tokio::task::spawn_blocking(move || builder.build())
        .await
        .context("Exporter startup task failed")??;

    if let Err(e) = exporter.serve().await {
        error!("Exporter failed: {}", e);
        std::process::exit(1);
    }

    info!("Exporter stopped");
    Ok(())
}
