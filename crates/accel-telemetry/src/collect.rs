//! Metric collection routines
//!
//! A [`CollectContext`] carries everything one collection cycle needs: the
//! negotiated source, the store, the current topology, the working required
//! set and the per-device shared reads. Every routine reports an [`Outcome`]
//! that the context folds back into the required set and the rebuild flag.

use crate::config::DiscoveryLimits;
use crate::metrics::{EntityKey, MetricValue};
use crate::registry::{
    Collector, MetricDefinition, MetricRegistry, BRIDGE_LINK_METRICS, LINK_INFO_METRICS,
    MEMORY_METRICS, PARTITION_MEMORY_METRICS, PCIE_LINK_METRICS, SERVER_METRICS,
};
use crate::source::{
    ClockIp, DpmIp, LinkDirection, LinkInfo, MemoryInfo, PartitionInfo, PartitionMemory, PcieLink,
    PmbusUnit, Query, QueryStatus, TelemetrySource, TemperatureSensor, UsageIp, LINK_COUNT,
    PCI_EVENT_KINDS,
};
use crate::store::{MetricStore, Partition};
use crate::topology::{DeviceRole, ProductFamily, Topology, TopologyDevice};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one metric routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Values were written (or there was nothing to write)
    Updated,
    /// The library reported the metric as unsupported
    Unsupported,
    /// A query failed; systemic failures force a topology rebuild
    Failed { systemic: bool },
}

impl Outcome {
    /// Combine the outcomes of several queries made by one routine
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Failed { systemic: true }, _) | (_, Outcome::Failed { systemic: true }) => {
                Outcome::Failed { systemic: true }
            }
            (Outcome::Unsupported, _) | (_, Outcome::Unsupported) => Outcome::Unsupported,
            (Outcome::Failed { .. }, _) | (_, Outcome::Failed { .. }) => {
                Outcome::Failed { systemic: false }
            }
            _ => Outcome::Updated,
        }
    }
}

/// Reads shared by several metrics of one device, refreshed per device visit
#[derive(Debug, Default)]
struct SharedReads {
    memory: BTreeMap<u32, MemoryInfo>,
    pcie: Option<PcieLink>,
    bridge: Option<PcieLink>,
    links: Option<LinkInfo>,
}

/// Collection state owned by one poller
#[derive(Debug)]
pub struct CollectContext {
    source: TelemetrySource,
    store: Arc<MetricStore>,
    topology: Arc<Topology>,
    limits: DiscoveryLimits,
    registry: MetricRegistry,
    required: BTreeSet<&'static str>,
    partition_required: BTreeSet<&'static str>,
    needs_rebuild: bool,
    links_healthy: bool,
    reads: SharedReads,
    partitions: BTreeMap<(u32, u32), PartitionInfo>,
    partition_memory: BTreeMap<(u32, u32), PartitionMemory>,
}

impl CollectContext {
    pub fn new(source: TelemetrySource, store: Arc<MetricStore>, limits: DiscoveryLimits) -> Self {
        Self {
            source,
            store,
            topology: Arc::new(Topology::new()),
            limits,
            registry: MetricRegistry::new(),
            required: BTreeSet::new(),
            partition_required: BTreeSet::new(),
            needs_rebuild: false,
            links_healthy: true,
            reads: SharedReads::default(),
            partitions: BTreeMap::new(),
            partition_memory: BTreeMap::new(),
        }
    }

    /// Install a new topology and working set, dropping every cache
    pub fn begin_generation(
        &mut self,
        topology: Arc<Topology>,
        required: impl IntoIterator<Item = &'static str>,
    ) {
        self.topology = topology;
        self.set_required(required);
        self.needs_rebuild = false;
        self.links_healthy = true;
        self.reads = SharedReads::default();
        self.partitions.clear();
        self.partition_memory.clear();
    }

    /// Replace the working set, splitting out partition-scoped metrics
    pub fn set_required(&mut self, required: impl IntoIterator<Item = &'static str>) {
        self.required.clear();
        self.partition_required.clear();
        for id in required {
            match self.registry.get(id) {
                Some(definition) if definition.is_partition_scoped() => {
                    self.partition_required.insert(definition.id);
                }
                Some(definition) => {
                    self.required.insert(definition.id);
                }
                None => warn!("Ignoring unknown metric {}", id),
            }
        }
    }

    pub fn source(&self) -> &TelemetrySource {
        &self.source
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Whether a metric is still collected in this generation
    pub fn is_required(&self, id: &str) -> bool {
        self.required.contains(id) || self.partition_required.contains(id)
    }

    /// Device, die and server metrics still collected
    pub fn required(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().copied()
    }

    pub fn partition_required(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.partition_required.iter().copied()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Aggregate interconnect link health of the current cycle
    pub fn links_healthy(&self) -> bool {
        self.links_healthy
    }

    /// Visit every role, then partitions, then server-level data
    pub fn run_cycle(&mut self) {
        self.links_healthy = true;
        let topology = self.topology.clone();

        for role in [
            DeviceRole::Native,
            DeviceRole::PhysicalFunction,
            DeviceRole::VirtualFunction,
        ] {
            for device in topology.devices_with_role(role) {
                self.visit_device(device);
            }
        }

        self.collect_partitions();
        self.collect_server();
    }

    /// Run every required routine applicable to the device's role
    pub fn visit_device(&mut self, device: &TopologyDevice) {
        debug!("Collecting device {} ({})", device.id, device.role);
        self.prefetch(device);

        let definitions: Vec<&'static MetricDefinition> = self
            .registry
            .for_role(device.role)
            .filter(|definition| self.required.contains(definition.id))
            .collect();

        for definition in definitions {
            let outcome = self.collect(definition, device);
            self.apply(definition.id, outcome);
        }
    }

    fn apply(&mut self, id: &'static str, outcome: Outcome) {
        match outcome {
            Outcome::Unsupported => {
                if self.required.remove(id) {
                    info!("Metric {} is not supported, dropping it until the next rebuild", id);
                }
            }
            Outcome::Failed { systemic: true } => {
                if !self.needs_rebuild {
                    warn!("Systemic failure while collecting {}, scheduling rebuild", id);
                }
                self.needs_rebuild = true;
            }
            _ => {}
        }
    }

    fn any_required(&self, ids: &[&str]) -> bool {
        ids.iter().any(|id| self.required.contains(*id))
    }

    fn prefetch(&mut self, device: &TopologyDevice) {
        self.reads = SharedReads::default();
        let id = device.id;

        let wants_memory = matches!(
            device.role,
            DeviceRole::Native | DeviceRole::VirtualFunction
        ) && self.any_required(&MEMORY_METRICS);
        if wants_memory {
            for die in 0..device.die_count {
                match self.source.memory_info(id, die) {
                    Ok(info) => {
                        self.reads.memory.insert(die, info);
                    }
                    Err(status) => {
                        warn!("Memory info query for device {} die {} failed: {}", id, die, status);
                        self.needs_rebuild = true;
                        break;
                    }
                }
            }
        }

        if device.role == DeviceRole::VirtualFunction {
            return;
        }

        if self.any_required(&PCIE_LINK_METRICS) {
            match self.source.pcie_info(id) {
                Ok(link) => self.reads.pcie = Some(link),
                Err(status) => {
                    warn!("PCIe info query for device {} failed: {}", id, status);
                    self.needs_rebuild = true;
                }
            }
        }

        if self.any_required(&BRIDGE_LINK_METRICS) {
            match self.source.pcie_max_link_info(id) {
                Ok(link) => self.reads.bridge = Some(link),
                Err(status) => {
                    warn!("PCIe bridge info query for device {} failed: {}", id, status);
                    self.needs_rebuild = true;
                }
            }
        }

        if device.role == DeviceRole::Native && self.any_required(&LINK_INFO_METRICS) {
            match self.source.link_info(id) {
                Ok(links) => {
                    if !links_nominal(&links) {
                        debug!("Device {} reports a degraded interconnect link", id);
                        self.links_healthy = false;
                    }
                    self.reads.links = Some(links);
                }
                Err(status) => {
                    warn!("Link info query for device {} failed: {}", id, status);
                    self.needs_rebuild = true;
                    self.links_healthy = false;
                }
            }
        }
    }

    /// Run the routine bound to one metric for one device
    pub fn collect(&mut self, definition: &MetricDefinition, device: &TopologyDevice) -> Outcome {
        let id = definition.id;
        match definition.collector {
            Collector::Temperature(sensor) => self.temperature(id, device, sensor),
            Collector::OpticalModuleTemperature => self.optical_module_temperature(id, device),
            Collector::Usage(ip) => self.usage(id, device, ip),
            Collector::MemoryUsage => {
                for (die, memory) in &self.reads.memory {
                    let value = MetricValue::from_pairs([
                        ("vram", percent(memory.vram_used, memory.vram_total)),
                        ("xtt", percent(memory.xtt_used, memory.xtt_total)),
                    ]);
                    self.store.update(EntityKey::Die(device.id, *die), id, value);
                }
                Outcome::Updated
            }
            Collector::MemoryTotal => {
                for (die, memory) in &self.reads.memory {
                    let value = MetricValue::from_pairs([
                        ("vram", memory.vram_total as f64),
                        ("xtt", memory.xtt_total as f64),
                    ]);
                    self.store.update(EntityKey::Die(device.id, *die), id, value);
                }
                Outcome::Updated
            }
            Collector::MemoryUsed => {
                for (die, memory) in &self.reads.memory {
                    let value = MetricValue::from_pairs([
                        ("vram", memory.vram_used as f64),
                        ("xtt", memory.xtt_used as f64),
                    ]);
                    self.store.update(EntityKey::Die(device.id, *die), id, value);
                }
                Outcome::Updated
            }
            Collector::BoardPower => match self.source.board_power(device.id) {
                Ok(ways) => {
                    let total: u32 = ways.iter().sum();
                    self.store
                        .update(EntityKey::Device(device.id), id, MetricValue::scalar(total));
                    Outcome::Updated
                }
                Err(status) => failed(id, EntityKey::Device(device.id), status, false),
            },
            Collector::PmbusPower => self.pmbus_power(id, device),
            Collector::Clock(ip) => self.clock(id, device, ip),
            Collector::MemoryClock => {
                let ip = match self.topology.family() {
                    ProductFamily::FamilyN => ClockIp::Mc,
                    ProductFamily::FamilyC => ClockIp::Mc0,
                };
                self.clock(id, device, ip)
            }
            Collector::PcieBandwidth => match self.source.pcie_throughput(device.id) {
                Ok(throughput) => {
                    let value = MetricValue::from_pairs([
                        ("tx", throughput.tx as f64),
                        ("rx", throughput.rx as f64),
                    ]);
                    self.store.update(EntityKey::Device(device.id), id, value);
                    Outcome::Updated
                }
                Err(status) => failed(id, EntityKey::Device(device.id), status, false),
            },
            Collector::LinkBandwidth => self.per_direction(id, device, |dev, direction| {
                self.source.link_bandwidth(dev, direction)
            }),
            Collector::LinkTraffic => self.per_direction(id, device, |dev, direction| {
                self.source.link_traffic(dev, direction)
            }),
            Collector::LinkAer => match self.source.link_aer(device.id) {
                Ok(links) => {
                    let ce = links.iter().enumerate().map(|(i, aer)| (i + 1, aer.ce as f64));
                    let ue = links.iter().enumerate().map(|(i, aer)| (i + 1, aer.ue as f64));
                    let value = MetricValue::from_groups([
                        ("ce", MetricValue::from_pairs(ce)),
                        ("ue", MetricValue::from_pairs(ue)),
                    ]);
                    self.store.update(EntityKey::Device(device.id), id, value);
                    Outcome::Updated
                }
                Err(status) => unsupported_or_failed(id, EntityKey::Device(device.id), status, true),
            },
            Collector::HbmBandwidth => {
                let mut outcome = Outcome::Updated;
                for die in 0..device.die_count {
                    let key = EntityKey::Die(device.id, die);
                    match self.source.hbm_bandwidth(device.id, die) {
                        Ok(bandwidth) => {
                            self.store
                                .update(key, id, MetricValue::Scalar(bandwidth as f64));
                        }
                        Err(status) => outcome = outcome.merge(failed(id, key, status, false)),
                    }
                }
                outcome
            }
            Collector::EthBandwidth => match self.source.eth_throughput(device.id) {
                Ok(throughput) => {
                    let value = MetricValue::from_pairs([
                        ("tx", throughput.tx as f64),
                        ("rx", throughput.rx as f64),
                    ]);
                    self.store.update(EntityKey::Device(device.id), id, value);
                    Outcome::Updated
                }
                Err(status) => unsupported_or_failed(id, EntityKey::Device(device.id), status, false),
            },
            Collector::DpmLevel(ip) => self.dpm_level(id, device, ip),
            Collector::PcieSpeed => self.link_scalar(id, device, self.reads.pcie.map(|l| l.speed)),
            Collector::PcieWidth => {
                self.link_scalar(id, device, self.reads.pcie.map(|l| f64::from(l.width)))
            }
            Collector::BridgeSpeed => {
                self.link_scalar(id, device, self.reads.bridge.map(|l| l.speed))
            }
            Collector::BridgeWidth => {
                self.link_scalar(id, device, self.reads.bridge.map(|l| f64::from(l.width)))
            }
            Collector::LinkSpeed => {
                let links = self.reads.links.map(|links| links.speed);
                self.per_link(id, device, links)
            }
            Collector::LinkWidth => {
                let links = self.reads.links.map(|links| links.width.map(f64::from));
                self.per_link(id, device, links)
            }
            Collector::ProcessCount => self.process_count(id, device),
            Collector::DeviceState => self.device_state(id, device),
            Collector::ThrottleReason => {
                for die in 0..device.die_count {
                    let key = EntityKey::Die(device.id, die);
                    match self.source.throttle_reason(device.id, die) {
                        Ok(mask) => self.store.update(key, id, MetricValue::Scalar(mask as f64)),
                        Err(status) => return unsupported_or_failed(id, key, status, true),
                    }
                }
                Outcome::Updated
            }
            Collector::EccCounts => {
                for die in 0..device.die_count {
                    let key = EntityKey::Die(device.id, die);
                    match self.source.ecc_counts(device.id, die) {
                        Ok(ecc) => {
                            let value = MetricValue::from_pairs([
                                ("sram_ce", ecc.sram_ce as f64),
                                ("sram_ue", ecc.sram_ue as f64),
                                ("dram_ce", ecc.dram_ce as f64),
                                ("dram_ue", ecc.dram_ue as f64),
                                ("retired_page", ecc.retired_page as f64),
                            ]);
                            self.store.update(key, id, value);
                        }
                        Err(status) => return unsupported_or_failed(id, key, status, true),
                    }
                }
                Outcome::Updated
            }
            Collector::PciEvents => self.pci_events(id, device),
            Collector::RasCount => self.ras_count(id, device),
            Collector::RasStatus => self.ras_status(id, device),
            // Gathered outside device visits
            Collector::TopologyInfo
            | Collector::PartitionComputeQuota
            | Collector::PartitionUsage
            | Collector::PartitionMemoryTotal
            | Collector::PartitionMemoryUsed
            | Collector::PartitionMemoryFree
            | Collector::ServerInfo
            | Collector::ServerConnStatus => Outcome::Updated,
        }
    }

    fn temperature(
        &self,
        id: &'static str,
        device: &TopologyDevice,
        sensor: TemperatureSensor,
    ) -> Outcome {
        if sensor == TemperatureSensor::Soc {
            let key = EntityKey::Device(device.id);
            return match self.source.device_temperature(device.id, sensor) {
                Ok(centi) => {
                    self.store.update(key, id, MetricValue::Scalar(f64::from(centi) / 100.0));
                    Outcome::Updated
                }
                Err(status) => failed(id, key, status, false),
            };
        }

        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            match self.source.die_temperature(device.id, die, sensor) {
                Ok(centi) => {
                    self.store.update(key, id, MetricValue::Scalar(f64::from(centi) / 100.0))
                }
                Err(status) => {
                    outcome = outcome.merge(unsupported_or_failed(id, key, status, false))
                }
            }
        }
        outcome
    }

    fn optical_module_temperature(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let key = EntityKey::Device(device.id);
        match self.source.optical_module_temperatures(device.id) {
            Ok(modules) => {
                let value = MetricValue::from_pairs(
                    modules
                        .iter()
                        .enumerate()
                        .map(|(module, centi)| (module, f64::from(*centi) / 100.0)),
                );
                self.store.update(key, id, value);
                Outcome::Updated
            }
            Err(status) => unsupported_or_failed(id, key, status, true),
        }
    }

    fn usage(&self, id: &'static str, device: &TopologyDevice, ip: UsageIp) -> Outcome {
        if ip.is_device_scoped() {
            let key = EntityKey::Device(device.id);
            return match self.source.device_ip_usage(device.id, ip) {
                Ok(usage) => {
                    self.store.update(key, id, MetricValue::scalar(usage));
                    Outcome::Updated
                }
                Err(status) => failed(id, key, status, true),
            };
        }

        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            match self.source.die_ip_usage(device.id, die, ip) {
                Ok(usage) => self.store.update(key, id, MetricValue::scalar(usage)),
                Err(status) => outcome = outcome.merge(unsupported_or_failed(id, key, status, true)),
            }
        }
        outcome
    }

    fn pmbus_power(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            let mut rails = BTreeMap::new();
            for unit in PmbusUnit::ALL {
                match self.source.pmbus_power(device.id, die, unit) {
                    Ok(power) => {
                        rails.insert(unit.name(), f64::from(power));
                    }
                    Err(status) if status.is_not_supported() => continue,
                    Err(status) => outcome = outcome.merge(failed(id, key, status, false)),
                }
            }
            self.store.update(key, id, MetricValue::from_pairs(rails));
        }
        outcome
    }

    fn clock(&self, id: &'static str, device: &TopologyDevice, ip: ClockIp) -> Outcome {
        if ip.is_device_scoped() {
            let key = EntityKey::Device(device.id);
            return match self.source.device_clocks(device.id, ip) {
                Ok(clocks) => {
                    if let Some(mhz) = clocks.first() {
                        self.store.update(key, id, MetricValue::scalar(*mhz));
                    }
                    Outcome::Updated
                }
                Err(status) => failed(id, key, status, false),
            };
        }

        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            match self.source.die_clocks(device.id, die, ip) {
                Ok(clocks) => {
                    if let Some(mhz) = clocks.first() {
                        self.store.update(key, id, MetricValue::scalar(*mhz));
                    }
                }
                Err(status) => {
                    outcome = outcome.merge(unsupported_or_failed(id, key, status, false))
                }
            }
        }
        outcome
    }

    fn dpm_level(&self, id: &'static str, device: &TopologyDevice, ip: DpmIp) -> Outcome {
        let mut outcome = Outcome::Updated;
        let reads = match ip {
            DpmIp::Dla => vec![(
                EntityKey::Device(device.id),
                self.source.device_dpm_level(device.id, ip),
            )],
            DpmIp::Xcore => (0..device.die_count)
                .map(|die| {
                    (
                        EntityKey::Die(device.id, die),
                        self.source.die_dpm_level(device.id, die, ip),
                    )
                })
                .collect(),
        };

        for (key, read) in reads {
            match read {
                Ok(level) => self.store.update(key, id, MetricValue::scalar(level)),
                // Performance levels are optional per board, never de-supported
                Err(QueryStatus::NotSupported) => {}
                Err(status) => outcome = outcome.merge(failed(id, key, status, false)),
            }
        }
        outcome
    }

    fn per_direction<F>(&self, id: &'static str, device: &TopologyDevice, read: F) -> Outcome
    where
        F: Fn(u32, LinkDirection) -> Query<Vec<u64>>,
    {
        let key = EntityKey::Device(device.id);
        let mut groups = Vec::with_capacity(LinkDirection::BOTH.len());
        for direction in LinkDirection::BOTH {
            match read(device.id, direction) {
                Ok(links) => {
                    let pairs = links
                        .iter()
                        .enumerate()
                        .map(|(link, value)| (link + 1, *value as f64));
                    groups.push((direction.name(), MetricValue::from_pairs(pairs)));
                }
                Err(status) => return unsupported_or_failed(id, key, status, true),
            }
        }
        self.store.update(key, id, MetricValue::from_groups(groups));
        Outcome::Updated
    }

    fn link_scalar(&self, id: &'static str, device: &TopologyDevice, value: Option<f64>) -> Outcome {
        match value {
            Some(value) => {
                self.store
                    .update(EntityKey::Device(device.id), id, MetricValue::Scalar(value));
                Outcome::Updated
            }
            // Read failure already reported by the shared read
            None => Outcome::Failed { systemic: false },
        }
    }

    fn per_link(
        &self,
        id: &'static str,
        device: &TopologyDevice,
        links: Option<[f64; LINK_COUNT]>,
    ) -> Outcome {
        match links {
            Some(links) => {
                let pairs = links.iter().enumerate().map(|(link, value)| (link + 1, *value));
                self.store
                    .update(EntityKey::Device(device.id), id, MetricValue::from_pairs(pairs));
                Outcome::Updated
            }
            None => Outcome::Failed { systemic: false },
        }
    }

    fn process_count(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let processes = match self.source.processes(device.id, self.limits.max_processes) {
            Ok(processes) => processes,
            Err(status) => return failed(id, EntityKey::Device(device.id), status, false),
        };

        for die in 0..device.die_count {
            let count = processes
                .iter()
                .filter(|process| process.dies.contains(&(device.id, die)))
                .count();
            self.store.update(
                EntityKey::Die(device.id, die),
                id,
                MetricValue::Scalar(count as f64),
            );
        }
        Outcome::Updated
    }

    fn device_state(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            match self.source.device_state(device.id) {
                Ok(state) => {
                    let reason = if state == 0 {
                        self.source
                            .unavailable_reason(device.id, die)
                            .unwrap_or_default()
                    } else {
                        String::new()
                    };
                    self.store.update(key, id, MetricValue::from_pairs([(reason, state)]));
                }
                Err(status) => outcome = outcome.merge(failed(id, key, status, false)),
            }
        }
        outcome
    }

    fn pci_events(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let key = EntityKey::Device(device.id);
        let mut outcome = Outcome::Updated;
        let mut groups: BTreeMap<&str, BTreeMap<String, f64>> = PCI_EVENT_KINDS
            .iter()
            .map(|kind| (kind.name(), BTreeMap::new()))
            .collect();

        for kind in PCI_EVENT_KINDS {
            match self.source.pci_events(device.id, kind) {
                Ok(events) => {
                    let group = groups.entry(kind.name()).or_default();
                    for event in events {
                        group.insert(event.name, event.count as f64);
                    }
                }
                Err(status) if status.is_not_supported() => {
                    outcome = Outcome::Unsupported;
                    break;
                }
                Err(status) => {
                    warn!("PCI {} event query for {} failed: {}", kind.name(), key, status);
                }
            }
        }

        let value = MetricValue::from_groups(
            groups
                .into_iter()
                .map(|(kind, events)| (kind, MetricValue::from_pairs(events))),
        );
        self.store.update(key, id, value);
        outcome
    }

    fn ras_count(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            let mut registers = BTreeMap::new();
            let unsupported = match self.source.ras_errors(device.id, die) {
                Ok(errors) => {
                    for register in errors {
                        let name = format!("{} reg{}", register.ip, register.index);
                        registers.insert(format!("{} ue", name), register.ue as f64);
                        registers.insert(format!("{} ce", name), register.ce as f64);
                    }
                    false
                }
                Err(status) => {
                    outcome = outcome.merge(unsupported_or_failed(id, key, status, false));
                    status.is_not_supported()
                }
            };
            self.store.update(key, id, MetricValue::from_pairs(registers));
            if unsupported {
                break;
            }
        }
        outcome
    }

    fn ras_status(&self, id: &'static str, device: &TopologyDevice) -> Outcome {
        let mut outcome = Outcome::Updated;
        for die in 0..device.die_count {
            let key = EntityKey::Die(device.id, die);
            let mut registers = BTreeMap::new();
            match self.source.ras_status(device.id, die) {
                Ok(status_words) => {
                    for register in status_words {
                        registers.insert(
                            format!("{} reg{}", register.ip, register.index),
                            register.data as f64,
                        );
                    }
                }
                Err(status) => {
                    outcome = outcome.merge(unsupported_or_failed(id, key, status, false))
                }
            }
            self.store.update(key, id, MetricValue::from_pairs(registers));
        }
        outcome
    }

    /// Re-enumerate virtual partitions and collect their metrics
    pub fn collect_partitions(&mut self) {
        self.partitions.clear();
        self.partition_memory.clear();
        self.store.clear_partitions();

        if self.partition_required.is_empty() {
            return;
        }

        let wants_memory = PARTITION_MEMORY_METRICS
            .iter()
            .any(|id| self.partition_required.contains(*id));
        let topology = self.topology.clone();

        for device in topology.devices_with_role(DeviceRole::Native) {
            let count = self.source.partition_count(device.id);
            if count <= 0 {
                continue;
            }
            debug!("Device {} reports {} partitions", device.id, count);
            self.enumerate_partitions(device.id, count as u32);
            if wants_memory {
                self.read_partition_memory(device.id);
            }
        }

        let required: Vec<&'static MetricDefinition> = self
            .partition_required
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        for definition in required {
            self.collect_partition_metric(definition);
        }
    }

    fn enumerate_partitions(&mut self, device: u32, count: u32) {
        let mut found = 0;
        for partition in 0..self.limits.max_partitions {
            if found >= count {
                break;
            }
            match self.source.partition_info(device, partition) {
                Ok(info) => {
                    found += 1;
                    let annotation = self.source.partition_annotation(device, partition);
                    self.store.insert_partition(Partition {
                        device_id: device,
                        partition_id: partition,
                        info: info.clone(),
                        annotation,
                    });
                    self.partitions.insert((device, partition), info);
                }
                Err(status) if status.is_not_supported() => continue,
                Err(status) => {
                    warn!(
                        "Partition info query for device {} partition {} failed: {}",
                        device, partition, status
                    );
                    self.needs_rebuild = true;
                    break;
                }
            }
        }
    }

    fn read_partition_memory(&mut self, device: u32) {
        let partitions: Vec<u32> = self
            .partitions
            .keys()
            .filter(|(owner, _)| *owner == device)
            .map(|(_, partition)| *partition)
            .collect();

        for partition in partitions {
            match self.source.partition_memory(device, partition) {
                Ok(memory) => {
                    self.partition_memory.insert((device, partition), memory);
                }
                Err(status) if status.is_not_supported() => continue,
                Err(status) => {
                    warn!(
                        "Partition memory query for device {} partition {} failed: {}",
                        device, partition, status
                    );
                    self.needs_rebuild = true;
                    break;
                }
            }
        }
    }

    fn collect_partition_metric(&self, definition: &MetricDefinition) {
        let id = definition.id;
        match definition.collector {
            Collector::PartitionComputeQuota => {
                for ((device, partition), info) in &self.partitions {
                    self.store.update(
                        EntityKey::Partition(*device, *partition),
                        id,
                        MetricValue::scalar(info.compute_quota),
                    );
                }
            }
            Collector::PartitionUsage => {
                for (device, partition) in self.partitions.keys() {
                    let key = EntityKey::Partition(*device, *partition);
                    match self.source.partition_usage(*device, *partition) {
                        Ok(usage) => {
                            self.store
                                .update(key, id, MetricValue::Scalar(f64::from(usage) / 100.0))
                        }
                        Err(status) if status.is_not_supported() => {}
                        Err(status) => warn!("Collecting {} for {} failed: {}", id, key, status),
                    }
                }
            }
            Collector::PartitionMemoryTotal
            | Collector::PartitionMemoryUsed
            | Collector::PartitionMemoryFree => {
                for ((device, partition), memory) in &self.partition_memory {
                    let kib = match definition.collector {
                        Collector::PartitionMemoryTotal => memory.total,
                        Collector::PartitionMemoryUsed => memory.used,
                        _ => memory.free,
                    };
                    self.store.update(
                        EntityKey::Partition(*device, *partition),
                        id,
                        MetricValue::Scalar(kib as f64 / 1024.0),
                    );
                }
            }
            other => debug!("Metric {} ({:?}) is not partition scoped", id, other),
        }
    }

    /// Collect server identity and link status when required
    pub fn collect_server(&mut self) {
        if !self.any_required(&SERVER_METRICS) {
            return;
        }

        let uuids = match self.source.server_uuids() {
            Ok(uuids) => uuids,
            Err(status) => {
                if !status.is_not_supported() {
                    warn!("Server uuid query failed: {}", status);
                    self.needs_rebuild = true;
                }
                return;
            }
        };

        if self.required.contains("server_info") {
            let remote = uuids
                .remotes
                .iter()
                .enumerate()
                .filter(|(_, uuid)| !uuid.is_empty())
                .map(|(index, uuid)| (uuid.clone(), (index + 1) as f64));
            let value = MetricValue::from_groups([
                ("local", MetricValue::from_pairs([(uuids.local.clone(), 1.0)])),
                ("remote", MetricValue::from_pairs(remote)),
            ]);
            self.store.update_server("server_info", value);
        }

        if self.required.contains("server_conn_status") {
            let status = if self.links_healthy { 1.0 } else { 0.0 };
            self.store.update_server(
                "server_conn_status",
                MetricValue::from_pairs([(uuids.local, status)]),
            );
        }
    }
}

/// Active links must run at x16 and 32 or 2.5 GT/s; idle links are ignored
pub fn links_nominal(links: &LinkInfo) -> bool {
    links
        .speed
        .iter()
        .zip(links.width.iter())
        .filter(|(speed, width)| !(**speed == 0.0 && **width == 0))
        .all(|(speed, width)| *width == 16 && (*speed == 32.0 || *speed == 2.5))
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

fn unsupported_or_failed(
    metric: &str,
    key: EntityKey,
    status: QueryStatus,
    systemic: bool,
) -> Outcome {
    if status.is_not_supported() {
        return Outcome::Unsupported;
    }
    failed(metric, key, status, systemic)
}

fn failed(metric: &str, key: EntityKey, status: QueryStatus, systemic: bool) -> Outcome {
    warn!("Collecting {} for {} failed: {}", metric, key, status);
    Outcome::Failed { systemic }
}
