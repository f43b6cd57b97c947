//! Static metric catalog
//!
//! Each [`MetricDefinition`] names a metric id, the device roles and product
//! families it applies to, and the [`Collector`] routine that produces it.

use crate::source::{ClockIp, DpmIp, TemperatureSensor, UsageIp};
use crate::topology::{DeviceRole, ProductFamily};

use serde::{Deserialize, Serialize};

/// Role and family applicability of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicability {
    pub native: bool,
    pub physical_function: bool,
    pub virtual_function: bool,
    pub partition: bool,
    pub family_n: bool,
    pub family_c: bool,
}

impl Applicability {
    /// Roles (native, pf, vf, partition) followed by families (N, C)
    pub const fn new(bits: [u8; 6]) -> Self {
        Self {
            native: bits[0] == 1,
            physical_function: bits[1] == 1,
            virtual_function: bits[2] == 1,
            partition: bits[3] == 1,
            family_n: bits[4] == 1,
            family_c: bits[5] == 1,
        }
    }

    pub fn applies_to_role(&self, role: DeviceRole) -> bool {
        match role {
            DeviceRole::Native => self.native,
            DeviceRole::PhysicalFunction => self.physical_function,
            DeviceRole::VirtualFunction => self.virtual_function,
        }
    }

    pub fn applies_to_family(&self, family: ProductFamily) -> bool {
        match family {
            ProductFamily::FamilyN => self.family_n,
            ProductFamily::FamilyC => self.family_c,
        }
    }
}

/// Collection routine bound to a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collector {
    Temperature(TemperatureSensor),
    OpticalModuleTemperature,
    Usage(UsageIp),
    MemoryUsage,
    MemoryTotal,
    MemoryUsed,
    BoardPower,
    PmbusPower,
    Clock(ClockIp),
    MemoryClock,
    PcieBandwidth,
    LinkBandwidth,
    HbmBandwidth,
    EthBandwidth,
    DpmLevel(DpmIp),
    PcieSpeed,
    PcieWidth,
    BridgeSpeed,
    BridgeWidth,
    LinkSpeed,
    LinkWidth,
    LinkTraffic,
    LinkAer,
    /// Emitted from topology data at export time
    TopologyInfo,
    ProcessCount,
    DeviceState,
    ThrottleReason,
    EccCounts,
    PartitionComputeQuota,
    PartitionUsage,
    PartitionMemoryTotal,
    PartitionMemoryUsed,
    PartitionMemoryFree,
    ServerInfo,
    ServerConnStatus,
    PciEvents,
    RasCount,
    RasStatus,
}

/// One entry of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricDefinition {
    pub id: &'static str,
    pub applicability: Applicability,
    pub collector: Collector,
}

impl MetricDefinition {
    const fn new(id: &'static str, bits: [u8; 6], collector: Collector) -> Self {
        Self {
            id,
            applicability: Applicability::new(bits),
            collector,
        }
    }

    pub fn is_partition_scoped(&self) -> bool {
        self.applicability.partition
    }

    pub fn is_server_scoped(&self) -> bool {
        matches!(self.collector, Collector::ServerInfo | Collector::ServerConnStatus)
    }
}

/// Memory metrics sharing one per-device memory read
pub const MEMORY_METRICS: [&str; 3] = ["memory_usage", "memory_total", "memory_used"];
/// Metrics sharing one PCIe link read
pub const PCIE_LINK_METRICS: [&str; 2] = ["pcie_speed", "pcie_width"];
/// Metrics sharing one upstream bridge read
pub const BRIDGE_LINK_METRICS: [&str; 2] = ["pcie_bridge_speed", "pcie_bridge_width"];
/// Metrics sharing one interconnect link read
pub const LINK_INFO_METRICS: [&str; 3] = ["mxlk_speed", "mxlk_width", "server_conn_status"];
/// Partition metrics needing a memory read
pub const PARTITION_MEMORY_METRICS: [&str; 3] =
    ["sgpu_memory_total", "sgpu_memory_used", "sgpu_memory_free"];
/// Server-level metrics
pub const SERVER_METRICS: [&str; 2] = ["server_info", "server_conn_status"];

use Collector as C;

static CATALOG: [MetricDefinition; 50] = [
    // Temperature
    MetricDefinition::new("chip_hotspot_temp", [1, 1, 0, 0, 1, 1], C::Temperature(TemperatureSensor::Hotspot)),
    MetricDefinition::new("chip_hbm_temp", [1, 1, 0, 0, 0, 1], C::Temperature(TemperatureSensor::Hbm)),
    MetricDefinition::new("board_soc_temp", [1, 1, 0, 0, 1, 1], C::Temperature(TemperatureSensor::Soc)),
    MetricDefinition::new("board_core_temp", [1, 1, 0, 0, 1, 1], C::Temperature(TemperatureSensor::Core)),
    MetricDefinition::new("optical_module_temp", [1, 1, 0, 0, 0, 1], C::OpticalModuleTemperature),
    // Usage
    MetricDefinition::new("dla_usage", [1, 1, 1, 0, 1, 0], C::Usage(UsageIp::Dla)),
    MetricDefinition::new("g2d_usage", [1, 1, 1, 0, 1, 0], C::Usage(UsageIp::G2d)),
    MetricDefinition::new("gpu_usage", [1, 1, 1, 0, 0, 1], C::Usage(UsageIp::Xcore)),
    MetricDefinition::new("vpue_usage", [1, 1, 1, 0, 1, 1], C::Usage(UsageIp::Vpue)),
    MetricDefinition::new("vpud_usage", [1, 1, 1, 0, 1, 1], C::Usage(UsageIp::Vpud)),
    MetricDefinition::new("memory_usage", [1, 0, 1, 0, 1, 1], C::MemoryUsage),
    MetricDefinition::new("memory_total", [1, 0, 1, 0, 1, 1], C::MemoryTotal),
    MetricDefinition::new("memory_used", [1, 0, 1, 0, 1, 1], C::MemoryUsed),
    // Power
    MetricDefinition::new("board_power", [1, 1, 0, 0, 1, 1], C::BoardPower),
    MetricDefinition::new("pmbus_power", [1, 1, 0, 0, 1, 1], C::PmbusPower),
    // Clocks
    MetricDefinition::new("dla_clock", [1, 1, 0, 0, 1, 0], C::Clock(ClockIp::Dla)),
    MetricDefinition::new("g2d_clock", [1, 1, 0, 0, 1, 0], C::Clock(ClockIp::G2d)),
    MetricDefinition::new("gpu_clock", [1, 1, 0, 0, 0, 1], C::Clock(ClockIp::Xcore)),
    MetricDefinition::new("vpue_clock", [1, 1, 0, 0, 1, 1], C::Clock(ClockIp::Vpue)),
    MetricDefinition::new("vpud_clock", [1, 1, 0, 0, 1, 1], C::Clock(ClockIp::Vpud)),
    MetricDefinition::new("mem_clock", [1, 1, 0, 0, 1, 1], C::MemoryClock),
    // Bandwidth
    MetricDefinition::new("pcie_bw", [1, 1, 0, 0, 1, 1], C::PcieBandwidth),
    MetricDefinition::new("mxlk_bw", [1, 0, 0, 0, 0, 1], C::LinkBandwidth),
    MetricDefinition::new("hbm_bw", [1, 1, 0, 0, 1, 1], C::HbmBandwidth),
    MetricDefinition::new("eth_bw", [1, 1, 0, 0, 0, 1], C::EthBandwidth),
    // Performance levels
    MetricDefinition::new("dla_dpm_level", [1, 1, 0, 0, 1, 0], C::DpmLevel(DpmIp::Dla)),
    MetricDefinition::new("xcore_dpm_level", [1, 1, 0, 0, 0, 1], C::DpmLevel(DpmIp::Xcore)),
    // Links
    MetricDefinition::new("pcie_speed", [1, 1, 0, 0, 1, 1], C::PcieSpeed),
    MetricDefinition::new("pcie_width", [1, 1, 0, 0, 1, 1], C::PcieWidth),
    MetricDefinition::new("pcie_bridge_speed", [1, 1, 0, 0, 1, 1], C::BridgeSpeed),
    MetricDefinition::new("pcie_bridge_width", [1, 1, 0, 0, 1, 1], C::BridgeWidth),
    MetricDefinition::new("mxlk_speed", [1, 0, 0, 0, 0, 1], C::LinkSpeed),
    MetricDefinition::new("mxlk_width", [1, 0, 0, 0, 0, 1], C::LinkWidth),
    MetricDefinition::new("mxlk_traffic_total_bytes", [1, 0, 0, 0, 0, 1], C::LinkTraffic),
    MetricDefinition::new("mxlk_aer_count", [1, 0, 0, 0, 0, 1], C::LinkAer),
    MetricDefinition::new("topo_info", [0, 0, 0, 0, 0, 1], C::TopologyInfo),
    // State
    MetricDefinition::new("process", [1, 0, 1, 0, 1, 1], C::ProcessCount),
    MetricDefinition::new("gpu_state", [1, 0, 1, 0, 1, 1], C::DeviceState),
    MetricDefinition::new("clk_thr", [1, 1, 0, 0, 0, 1], C::ThrottleReason),
    MetricDefinition::new("ecc_error_count", [1, 1, 0, 0, 0, 1], C::EccCounts),
    // Partitions
    MetricDefinition::new("sgpu_compute_quota", [0, 0, 0, 1, 0, 1], C::PartitionComputeQuota),
    MetricDefinition::new("sgpu_usage", [0, 0, 0, 1, 0, 1], C::PartitionUsage),
    MetricDefinition::new("sgpu_memory_total", [0, 0, 0, 1, 0, 1], C::PartitionMemoryTotal),
    MetricDefinition::new("sgpu_memory_used", [0, 0, 0, 1, 0, 1], C::PartitionMemoryUsed),
    MetricDefinition::new("sgpu_memory_free", [0, 0, 0, 1, 0, 1], C::PartitionMemoryFree),
    // Server
    MetricDefinition::new("server_info", [0, 0, 0, 0, 0, 1], C::ServerInfo),
    MetricDefinition::new("server_conn_status", [0, 0, 0, 0, 0, 1], C::ServerConnStatus),
    // Error reporting
    MetricDefinition::new("pci_event", [1, 1, 0, 0, 0, 1], C::PciEvents),
    MetricDefinition::new("ras_count", [1, 1, 0, 0, 0, 1], C::RasCount),
    MetricDefinition::new("ras_status", [1, 1, 0, 0, 0, 1], C::RasStatus),
];

/// Read-only view over the metric catalog
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricRegistry;

impl MetricRegistry {
    pub fn new() -> Self {
        Self
    }

    /// All definitions in catalog order
    pub fn definitions(&self) -> impl Iterator<Item = &'static MetricDefinition> {
        CATALOG.iter()
    }

    pub fn get(&self, id: &str) -> Option<&'static MetricDefinition> {
        self.definitions().find(|definition| definition.id == id)
    }

    /// Metric ids whose family bit matches `family`
    pub fn supported_for(&self, family: ProductFamily) -> Vec<&'static str> {
        self.definitions()
            .filter(|definition| definition.applicability.applies_to_family(family))
            .map(|definition| definition.id)
            .collect()
    }

    /// Definitions applicable to a device role
    pub fn for_role(&self, role: DeviceRole) -> impl Iterator<Item = &'static MetricDefinition> {
        self.definitions()
            .filter(move |definition| definition.applicability.applies_to_role(role))
    }
}
