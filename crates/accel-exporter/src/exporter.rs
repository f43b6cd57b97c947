//! Exporter wiring
//!
//! Startup order: discover the topology, load the metric catalog against the
//! supported metric set, start the poller, start the log tailers whose
//! metrics are selected, then build the assembler behind the HTTP endpoint.

use crate::assembler::{Assembler, LogFeeds};
use crate::catalog::{MetricCatalog, DEFAULT_CATALOG_PATHS};
use crate::config::ExporterConfig;
use crate::endpoint::create_app;
use crate::pods::{FilePodResources, NoPodResources, PodResourceLookup};
use crate::{ExporterError, Result};
use accel_logwatch::{KernelLogWatch, SysLogWatch, TailerHandle};
use accel_telemetry::{DeviceLibrary, MetricStore, Poller, PollerHandle, UnloadedLibrary};
use axum::Router;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// A running exporter: poller thread, log tailers and the scrape assembler
#[derive(Debug)]
pub struct Exporter {
    config: ExporterConfig,
    assembler: Arc<Assembler>,
    poller: PollerHandle,
    tailers: Vec<TailerHandle>,
    logs: LogFeeds,
}

impl Exporter {
    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn assembler(&self) -> Arc<Assembler> {
        self.assembler.clone()
    }

    pub fn store(&self) -> Arc<MetricStore> {
        self.poller.store()
    }

    pub fn log_feeds(&self) -> &LogFeeds {
        &self.logs
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    /// The HTTP application for this exporter
    pub fn router(&self) -> Router {
        create_app(self.assembler.clone())
    }

    /// Serve on the configured address until Ctrl+C or SIGTERM
    pub async fn serve(&mut self) -> Result<()> {
        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            ExporterError::Config(format!("Failed to bind {}: {}", address, e))
        })?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` completes, then stop collection
    pub async fn serve_on<F>(&mut self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Serving metrics on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.stop()
    }

    /// Stop the log tailers and the poller
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping exporter");
        for tailer in &mut self.tailers {
            tailer.stop()?;
        }
        self.poller.stop()?;
        Ok(())
    }
}

/// Builder for [`Exporter`]
pub struct ExporterBuilder {
    config: Option<ExporterConfig>,
    library: Option<Arc<dyn DeviceLibrary>>,
    pods: Option<Arc<dyn PodResourceLookup>>,
    host: Option<String>,
    catalog: Option<MetricCatalog>,
}

impl ExporterBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            library: None,
            pods: None,
            host: None,
            catalog: None,
        }
    }

    pub fn with_config(mut self, config: ExporterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Device library backend; defaults to [`UnloadedLibrary`]
    pub fn with_library(mut self, library: Arc<dyn DeviceLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    /// Pod lookup; defaults to the configured pod resource file, if any
    pub fn with_pod_lookup(mut self, pods: Arc<dyn PodResourceLookup>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Host label; defaults to [`host_name`]
    pub fn with_host_name(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Use `catalog` as is instead of loading the configured file
    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Build and start the exporter
    ///
    /// Blocks until two consecutive device-count reads agree.
    pub fn build(self) -> Result<Exporter> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let library = self
            .library
            .unwrap_or_else(|| Arc::new(UnloadedLibrary) as Arc<dyn DeviceLibrary>);
        let mut poller = Poller::new(library, config.poller.clone())?;

        info!("Waiting for a consistent device topology");
        let supported = poller.initialize();

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => {
                let mut known: HashSet<&str> = supported.iter().copied().collect();
                known.extend(KernelLogWatch::SUPPORTED_METRICS.iter().copied());
                known.extend(SysLogWatch::SUPPORTED_METRICS.iter().copied());
                load_catalog(&config, &known)?
            }
        };
        if catalog.is_empty() {
            warn!("Metric catalog selects no families");
        }

        poller.set_required(
            catalog
                .ids()
                .filter(|id| supported.iter().any(|candidate| candidate == id)),
        );
        let store = poller.store();
        let poller = poller.start()?;

        let mut tailers = Vec::new();
        let mut logs = LogFeeds::default();

        if selects_any(&catalog, KernelLogWatch::SUPPORTED_METRICS) {
            let watch = Arc::new(KernelLogWatch::new(config.tailer.clone()));
            tailers.push(watch.start(&config.mount_point, config.kernel_log.as_deref())?);
            logs.kernel = Some(watch);
        }

        if selects_any(&catalog, SysLogWatch::SUPPORTED_METRICS) {
            let watch = Arc::new(SysLogWatch::new(config.tailer.clone()));
            tailers.push(watch.start(&config.mount_point, config.system_log.as_deref())?);
            logs.system = Some(watch);
        }

        let pods: Arc<dyn PodResourceLookup> = match (self.pods, &config.pod_resources) {
            (Some(pods), _) => pods,
            (None, Some(path)) => Arc::new(FilePodResources::new(path)),
            (None, None) => Arc::new(NoPodResources),
        };
        let host = self.host.unwrap_or_else(host_name);
        info!("Exporting as host {:?}", host);

        let assembler = Assembler::new(store, &catalog)?
            .with_pod_lookup(pods)
            .with_log_feeds(logs.clone())
            .with_register_dir(config.register_dir.clone())
            .with_host_name(host);

        Ok(Exporter {
            config,
            assembler: Arc::new(assembler),
            poller,
            tailers,
            logs,
        })
    }
}

impl Default for ExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Node name for the `host` label
///
/// `NODE_NAME`, then `HOSTNAME`, then the kernel host name.
pub fn host_name() -> String {
    ["NODE_NAME", "HOSTNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|name| name.trim().to_string())
        })
        .unwrap_or_default()
}

fn selects_any(catalog: &MetricCatalog, ids: &[&str]) -> bool {
    ids.iter().any(|id| catalog.contains(id))
}

fn load_catalog(config: &ExporterConfig, supported: &HashSet<&str>) -> Result<MetricCatalog> {
    let path = match &config.metric_catalog {
        Some(path) => path.clone(),
        None => MetricCatalog::find_default().ok_or_else(|| {
            ExporterError::Catalog(format!(
                "No metric catalog found in {}",
                DEFAULT_CATALOG_PATHS.join(", ")
            ))
        })?,
    };
    MetricCatalog::from_file(path, supported)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_logwatch::TailerConfig;
    use accel_telemetry::mock::MockLibrary;
    use accel_telemetry::PollerConfig;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const CATALOG: &str = "\
chip_hotspot_temp,Gauge,accel_temperature,Hotspot temperature,deviceId,uuid,pod,namespace,container,host,driver,bios,name,dieId
driver_log_errors,Counter,accel_driver_log_errors,Driver log errors,submodule,level,deviceId,uuid,pod,namespace,container,host,driver,bios,name,dieId
not_a_metric,Gauge,accel_nothing,Nothing,deviceId
";

    fn config(dir: &TempDir) -> ExporterConfig {
        let catalog = dir.path().join("counters.csv");
        std::fs::write(&catalog, CATALOG).unwrap();

        ExporterConfig::new()
            .with_port(0)
            .with_metric_catalog(catalog)
            .with_mount_point(dir.path())
            .with_register_dir(dir.path().join("register"))
            .with_poller(
                PollerConfig::new()
                    .with_interval(Duration::from_millis(20))
                    .with_settle_delay(Duration::from_millis(1))
                    .with_retry_backoff(Duration::from_millis(1)),
            )
            .with_tailer(TailerConfig::new().with_poll_interval(Duration::from_millis(10)))
    }

    fn build(dir: &TempDir) -> Exporter {
        ExporterBuilder::new()
            .with_config(config(dir))
            .with_library(Arc::new(MockLibrary::new(2, 1)))
            .with_host_name("node-1")
            .build()
            .unwrap()
    }

    fn wait_for_scrape(exporter: &Exporter, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let text = exporter.assembler().scrape().unwrap();
            if text.contains(needle) || Instant::now() >= deadline {
                return text;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_build_selects_log_sources_from_catalog() {
        let dir = TempDir::new().unwrap();
        let mut exporter = build(&dir);

        assert!(exporter.is_running());
        assert!(exporter.log_feeds().kernel.is_some());
        assert!(exporter.log_feeds().system.is_none());
        assert_eq!(exporter.assembler().host_name(), "node-1");

        let ids: Vec<String> = exporter
            .assembler()
            .exported_ids()
            .map(str::to_string)
            .collect();
        assert_eq!(ids, vec!["chip_hotspot_temp", "driver_log_errors"]);

        let text = wait_for_scrape(&exporter, "accel_temperature{");
        assert!(text.contains("host=\"node-1\""));

        exporter.stop().unwrap();
        assert!(!exporter.is_running());
    }

    #[test]
    fn test_missing_catalog_is_a_configuration_issue() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_metric_catalog(dir.path().join("missing.csv"));

        let err = ExporterBuilder::new()
            .with_config(config)
            .with_library(Arc::new(MockLibrary::new(1, 1)))
            .build()
            .unwrap_err();
        assert!(err.is_configuration_issue());
    }

    #[test]
    fn test_host_name_is_never_padded() {
        let name = host_name();
        assert_eq!(name, name.trim());
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut exporter = build(&dir);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };

        shutdown_tx.send(()).unwrap();
        exporter.serve_on(listener, shutdown).await.unwrap();
        assert!(!exporter.is_running());
    }
}
