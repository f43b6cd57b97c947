//! Scrape-time export assembly
//!
//! Every scrape runs under one lock: refresh pods and topology, compute label
//! tuples, reset and refill every family from the metric store, add identity,
//! server and log-derived samples, then encode the registry as text.

use crate::catalog::{MetricCatalog, MetricKind, MetricSpec};
use crate::config::DEFAULT_REGISTER_DIR;
use crate::labels::{fit_labels, LabelSets};
use crate::pods::{NoPodResources, PodResourceLookup};
use crate::{ExporterError, Result};
use accel_logwatch::{KernelLogWatch, SysLogWatch};
use accel_telemetry::{EntityKey, EntitySnapshot, MetricStore, Topology};
use parking_lot::Mutex;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

// Families fed from outside the entity snapshot
const TOPOLOGY_INFO: &str = "topo_info";
const DRIVER_LOG_ERRORS: &str = "driver_log_errors";
const DRIVER_EID_ERRORS: &str = "driver_eid_errors";
const SDK_EID_ERRORS: &str = "sdk_eid_errors";

/// Log sources drained on every scrape
#[derive(Debug, Clone, Default)]
pub struct LogFeeds {
    pub kernel: Option<Arc<KernelLogWatch>>,
    pub system: Option<Arc<SysLogWatch>>,
}

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl Family {
    fn reset(&self) {
        match self {
            Family::Gauge(vec) => vec.reset(),
            Family::Counter(vec) => vec.reset(),
        }
    }

    fn set(&self, labels: &[&str], value: f64) {
        let result = match self {
            Family::Gauge(vec) => vec
                .get_metric_with_label_values(labels)
                .map(|gauge| gauge.set(value)),
            Family::Counter(vec) => vec.get_metric_with_label_values(labels).map(|counter| {
                counter.reset();
                if value > 0.0 {
                    counter.inc_by(value);
                }
            }),
        };
        if let Err(e) = result {
            warn!("Failed to set sample: {}", e);
        }
    }

    fn inc(&self, labels: &[&str]) {
        let result = match self {
            Family::Gauge(vec) => vec.get_metric_with_label_values(labels).map(|gauge| gauge.inc()),
            Family::Counter(vec) => vec
                .get_metric_with_label_values(labels)
                .map(|counter| counter.inc()),
        };
        if let Err(e) = result {
            warn!("Failed to increment sample: {}", e);
        }
    }
}

struct ExportedFamily {
    spec: MetricSpec,
    family: Family,
}

impl ExportedFamily {
    fn register(spec: &MetricSpec, registry: &Registry) -> Result<Self> {
        let help = if spec.help.is_empty() {
            spec.name.as_str()
        } else {
            spec.help.as_str()
        };
        let opts = Opts::new(spec.name.as_str(), help);
        let labels: Vec<&str> = spec.labels.iter().map(String::as_str).collect();

        let family = match spec.kind {
            MetricKind::Gauge => {
                let vec = GaugeVec::new(opts, &labels)?;
                registry.register(Box::new(vec.clone()))?;
                Family::Gauge(vec)
            }
            MetricKind::Counter => {
                let vec = CounterVec::new(opts, &labels)?;
                registry.register(Box::new(vec.clone()))?;
                Family::Counter(vec)
            }
            kind => {
                return Err(ExporterError::Catalog(format!(
                    "{} families cannot be exported",
                    kind
                )))
            }
        };

        Ok(Self {
            spec: spec.clone(),
            family,
        })
    }

    /// Set one sample, fitting `labels` to the family's label count
    fn set(&self, labels: &[String], value: f64) {
        self.family.set(&fit_labels(labels, self.spec.labels.len()), value);
    }

    fn inc(&self, labels: &[String]) {
        self.family.inc(&fit_labels(labels, self.spec.labels.len()));
    }
}

/// Device identity families emitted on every scrape
struct IdentityFamilies {
    device_type: GaugeVec,
    bios_version: GaugeVec,
    driver_version: GaugeVec,
}

impl IdentityFamilies {
    fn register(registry: &Registry) -> Result<Self> {
        let device_type = GaugeVec::new(
            Opts::new("accel_device_type", "Device type"),
            &["deviceId", "dieId", "deviceType", "uuid"],
        )?;
        let bios_version = GaugeVec::new(
            Opts::new("accel_bios_ver", "BIOS version"),
            &["deviceId", "dieId", "bios"],
        )?;
        let driver_version = GaugeVec::new(
            Opts::new("accel_driver_ver", "Driver version"),
            &["deviceId", "dieId", "driver"],
        )?;

        registry.register(Box::new(device_type.clone()))?;
        registry.register(Box::new(bios_version.clone()))?;
        registry.register(Box::new(driver_version.clone()))?;

        Ok(Self {
            device_type,
            bios_version,
            driver_version,
        })
    }

    fn refresh(&self, topology: &Topology) {
        self.device_type.reset();
        self.bios_version.reset();
        self.driver_version.reset();

        for die in topology.dies() {
            let device = die.device_id.to_string();
            let die_id = die.die_id.to_string();
            self.device_type
                .with_label_values(&[device.as_str(), die_id.as_str(), die.name.as_str(), die.uuid.as_str()])
                .set(1.0);
            self.bios_version
                .with_label_values(&[device.as_str(), die_id.as_str(), die.bios_version.as_str()])
                .set(1.0);
            self.driver_version
                .with_label_values(&[device.as_str(), die_id.as_str(), die.driver_version.as_str()])
                .set(1.0);
        }
    }
}

/// Joins store values with labels and encodes the result
pub struct Assembler {
    store: Arc<MetricStore>,
    pods: Arc<dyn PodResourceLookup>,
    logs: LogFeeds,
    register_dir: PathBuf,
    host: String,
    registry: Registry,
    families: Vec<ExportedFamily>,
    identity: IdentityFamilies,
    scrape_lock: Mutex<()>,
}

impl Assembler {
    /// Register one family per catalog entry
    ///
    /// Entries that cannot be registered (duplicate family names, invalid
    /// label names) are skipped with a warning.
    pub fn new(store: Arc<MetricStore>, catalog: &MetricCatalog) -> Result<Self> {
        let registry = Registry::new();
        let identity = IdentityFamilies::register(&registry)?;

        let mut families = Vec::with_capacity(catalog.len());
        for spec in catalog.specs() {
            match ExportedFamily::register(spec, &registry) {
                Ok(family) => families.push(family),
                Err(e) => warn!("Skipping metric {} ({}): {}", spec.id, spec.name, e),
            }
        }

        Ok(Self {
            store,
            pods: Arc::new(NoPodResources),
            logs: LogFeeds::default(),
            register_dir: PathBuf::from(DEFAULT_REGISTER_DIR),
            host: String::new(),
            registry,
            families,
            identity,
            scrape_lock: Mutex::new(()),
        })
    }

    pub fn with_pod_lookup(mut self, pods: Arc<dyn PodResourceLookup>) -> Self {
        self.pods = pods;
        self
    }

    pub fn with_log_feeds(mut self, logs: LogFeeds) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_register_dir(mut self, register_dir: impl Into<PathBuf>) -> Self {
        self.register_dir = register_dir.into();
        self
    }

    pub fn with_host_name(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host
    }

    /// Ids of the families that were registered
    pub fn exported_ids(&self) -> impl Iterator<Item = &str> {
        self.families.iter().map(|family| family.spec.id.as_str())
    }

    /// Assemble and encode one scrape
    pub fn scrape(&self) -> Result<String> {
        let _guard = self.scrape_lock.lock();
        debug!("Assembling metrics");

        let pods = self.pods.list();
        let topology = self.store.topology();
        let partitions = self.store.partitions();
        let labels = LabelSets::build(
            &topology,
            &partitions,
            &pods,
            &self.register_dir,
            &self.host,
        );

        let entities = self.store.snapshot();
        let partition_values = self.store.snapshot_partitions();
        for family in &self.families {
            family.family.reset();
            export_entities(family, &entities, &labels);
            export_entities(family, &partition_values, &labels);
        }

        self.identity.refresh(&topology);
        self.export_topology_info(&topology, &labels);
        self.export_server();
        self.export_logs(&topology, &labels);

        self.encode()
    }

    fn family(&self, id: &str) -> Option<&ExportedFamily> {
        self.families.iter().find(|family| family.spec.id == id)
    }

    fn export_topology_info(&self, topology: &Topology, labels: &LabelSets) {
        let family = match self.family(TOPOLOGY_INFO) {
            Some(family) => family,
            None => return,
        };

        for die in topology.dies() {
            for tuple in labels.get(EntityKey::Die(die.device_id, die.die_id)) {
                let mut values = vec![
                    die.topo_id.to_string(),
                    die.socket_id.to_string(),
                    die.die_id.to_string(),
                ];
                values.extend(tuple.iter().cloned());
                family.set(&values, 1.0);
            }
        }
    }

    fn export_server(&self) {
        for (id, value) in self.store.snapshot_server() {
            let family = match self.family(&id) {
                Some(family) => family,
                None => continue,
            };
            for (path, sample) in value.samples() {
                let mut values: Vec<String> = path.iter().map(|key| key.to_string()).collect();
                values.push(self.host.clone());
                family.set(&values, sample);
            }
        }
    }

    fn export_logs(&self, topology: &Topology, labels: &LabelSets) {
        if let Some(kernel) = &self.logs.kernel {
            let errors = kernel.drain_kernel_errors();
            if let Some(family) = self.family(DRIVER_LOG_ERRORS) {
                for record in errors {
                    let key = match log_entity(topology, labels, &record.bdf, record.die_id) {
                        Some(key) => key,
                        None => {
                            warn!("Dropping kernel log record for unknown device: {}", record);
                            continue;
                        }
                    };
                    for tuple in labels.get(key) {
                        let mut values = vec![record.submodule.clone(), record.level.clone()];
                        values.extend(tuple.iter().cloned());
                        family.inc(&values);
                    }
                }
            }

            let eids = kernel.drain_driver_eids();
            if let Some(family) = self.family(DRIVER_EID_ERRORS) {
                for record in eids {
                    let key = match log_entity(topology, labels, &record.bdf, record.die_id) {
                        Some(key) => key,
                        None => {
                            warn!("Dropping driver EID record for unknown device: {}", record);
                            continue;
                        }
                    };
                    for tuple in labels.get(key) {
                        let mut values = vec![record.info.clone()];
                        values.extend(tuple.iter().cloned());
                        family.set(&values, record.eid as f64);
                    }
                }
            }
        }

        if let Some(system) = &self.logs.system {
            let eids = system.drain_sdk_eids();
            if let Some(family) = self.family(SDK_EID_ERRORS) {
                for record in eids {
                    let key = match log_entity(topology, labels, &record.bdf, record.die_id()) {
                        Some(key) => key,
                        None => {
                            warn!("Dropping SDK EID record for unknown device: {}", record);
                            continue;
                        }
                    };
                    for tuple in labels.get(key) {
                        let mut values = vec![record.sdk_version.to_string(), record.info.clone()];
                        values.extend(tuple.iter().cloned());
                        family.set(&values, record.eid as f64);
                    }
                }
            }
        }
    }

    fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| ExporterError::Export(format!("Failed to convert metrics to string: {}", e)))
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("host", &self.host)
            .field("register_dir", &self.register_dir)
            .field("families", &self.families.len())
            .finish()
    }
}

/// Emit every value of `family.spec.id` found in `snapshot`
///
/// Nested keys are prepended to the entity's tuple, outer key first.
fn export_entities(family: &ExportedFamily, snapshot: &EntitySnapshot, labels: &LabelSets) {
    for (key, values) in snapshot {
        let value = match values.get(&family.spec.id) {
            Some(value) => value,
            None => continue,
        };

        let tuples = labels.get(*key);
        if tuples.is_empty() {
            debug!("No labels for {}, skipping {}", key, family.spec.id);
            continue;
        }

        for (path, sample) in value.samples() {
            for tuple in tuples {
                let mut values: Vec<String> = path.iter().map(|key| key.to_string()).collect();
                values.extend(tuple.iter().cloned());
                family.set(&values, sample);
            }
        }
    }
}

/// Die entity a log record belongs to, if its device is known
fn log_entity(topology: &Topology, labels: &LabelSets, bdf: &str, die_id: u32) -> Option<EntityKey> {
    let device = topology.device_for_bdf(bdf)?;
    labels
        .contains_device(device)
        .then_some(EntityKey::Die(device, die_id))
}
