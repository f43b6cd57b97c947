//! Telemetry source facade over the vendor device-management library
//!
//! The raw binding is modelled by [`DeviceLibrary`]. Newer entry points are
//! optional: [`TelemetrySource::new`] probes them once and records which call
//! variant each query uses in a [`Dispatch`] table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Number of interconnect link slots per device
pub const LINK_COUNT: usize = 7;

/// Number of PCI event categories reported by the library
pub const PCI_EVENT_KINDS: [PciEventKind; 5] = [
    PciEventKind::AerUe,
    PciEventKind::AerCe,
    PciEventKind::Synfld,
    PciEventKind::Dbe,
    PciEventKind::Mmio,
];

/// Outcome of a single library query
pub type Query<T> = std::result::Result<T, QueryStatus>;

/// Non-success status codes returned by the device library
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    #[error("operation failed")]
    Failure,
    #[error("no device")]
    NoDevice,
    #[error("operation not supported")]
    NotSupported,
    #[error("sysfs read error")]
    SysfsError,
    #[error("sysfs write error")]
    SysfsWriteError,
    #[error("invalid device id")]
    InvalidDeviceId,
    #[error("invalid die id")]
    InvalidDieId,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid input")]
    InvalidInput,
    #[error("insufficient buffer size")]
    InsufficientSize,
    #[error("ioctl failure")]
    IoControlFailure,
    #[error("mmap failure")]
    MmapFailure,
    #[error("munmap failure")]
    UnmmapFailure,
    #[error("invalid input for mmap")]
    InvalidInputForMmap,
    #[error("target virtual function not found")]
    TargetVfNotFound,
    #[error("invalid frequency")]
    InvalidFrequency,
    #[error("function level reset not ready")]
    FlrNotReady,
    #[error("failed to open device file")]
    OpenDeviceFileFailure,
    #[error("failed to close device file")]
    CloseDeviceFileFailure,
    #[error("device busy")]
    BusyDevice,
    #[error("mmio space exhausted")]
    MmioNotEnough,
    #[error("failed to get pci bridge")]
    GetPciBridgeFailure,
    #[error("failed to load library")]
    LoadLibraryFailure,
    #[error("unknown status code {0}")]
    Unknown(i32),
}

impl QueryStatus {
    /// Map a raw library return code. Code 0 is success.
    pub fn check(code: i32) -> Query<()> {
        let status = match code {
            0 => return Ok(()),
            1 => QueryStatus::Failure,
            2 => QueryStatus::NoDevice,
            3 => QueryStatus::NotSupported,
            4 => QueryStatus::SysfsError,
            5 => QueryStatus::SysfsWriteError,
            6 => QueryStatus::InvalidDeviceId,
            7 => QueryStatus::InvalidDieId,
            8 => QueryStatus::PermissionDenied,
            9 => QueryStatus::InvalidInput,
            10 => QueryStatus::InsufficientSize,
            12 => QueryStatus::IoControlFailure,
            13 => QueryStatus::MmapFailure,
            14 => QueryStatus::UnmmapFailure,
            15 => QueryStatus::InvalidInputForMmap,
            18 => QueryStatus::TargetVfNotFound,
            19 => QueryStatus::InvalidFrequency,
            20 => QueryStatus::FlrNotReady,
            21 => QueryStatus::OpenDeviceFileFailure,
            22 => QueryStatus::CloseDeviceFileFailure,
            23 => QueryStatus::BusyDevice,
            24 => QueryStatus::MmioNotEnough,
            25 => QueryStatus::GetPciBridgeFailure,
            26 => QueryStatus::LoadLibraryFailure,
            other => QueryStatus::Unknown(other),
        };
        Err(status)
    }

    /// Check if this status reports a missing capability
    pub fn is_not_supported(&self) -> bool {
        matches!(self, QueryStatus::NotSupported)
    }

    /// Check if this status means the device set itself is no longer valid
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            QueryStatus::NoDevice
                | QueryStatus::InvalidDeviceId
                | QueryStatus::InvalidDieId
                | QueryStatus::OpenDeviceFileFailure
                | QueryStatus::LoadLibraryFailure
        )
    }
}

/// Product brand reported in the device identity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Brand {
    Unknown,
    N,
    C,
    G,
}

/// Virtualization mode of a device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualizationMode {
    None,
    Pf,
    Vf,
}

/// Base identity record of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceInfo {
    pub device_id: u32,
    pub mode: VirtualizationMode,
    pub brand: Brand,
    pub uuid: String,
    pub bdf: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionUnit {
    Driver,
    Bios,
}

/// Interconnect topology placement of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTopology {
    pub topology_id: i32,
    pub socket_id: i32,
}

/// Memory occupancy in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub vram_total: u64,
    pub vram_used: u64,
    pub xtt_total: u64,
    pub xtt_used: u64,
}

/// Negotiated PCIe link speed (GT/s) and width (lanes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PcieLink {
    pub speed: f64,
    pub width: u32,
}

/// Per-slot interconnect link state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub speed: [f64; LINK_COUNT],
    pub width: [u32; LINK_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemperatureSensor {
    Hotspot,
    Hbm,
    Soc,
    Core,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageIp {
    Dla,
    G2d,
    Xcore,
    Vpue,
    Vpud,
}

impl UsageIp {
    /// Device-wide engines have no per-die counter
    pub fn is_device_scoped(&self) -> bool {
        matches!(self, UsageIp::Dla | UsageIp::G2d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockIp {
    Dla,
    G2d,
    Xcore,
    Vpue,
    Vpud,
    Mc,
    Mc0,
}

impl ClockIp {
    pub fn is_device_scoped(&self) -> bool {
        matches!(self, ClockIp::Dla | ClockIp::G2d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpmIp {
    Dla,
    Xcore,
}

/// Power rails measured through PMBus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PmbusUnit {
    Soc,
    Core,
    Hbm,
    Pcie,
    Hbm2,
    Pcie2,
}

impl PmbusUnit {
    pub const ALL: [PmbusUnit; 6] = [
        PmbusUnit::Soc,
        PmbusUnit::Core,
        PmbusUnit::Hbm,
        PmbusUnit::Pcie,
        PmbusUnit::Hbm2,
        PmbusUnit::Pcie2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PmbusUnit::Soc => "soc",
            PmbusUnit::Core => "core",
            PmbusUnit::Hbm => "hbm",
            PmbusUnit::Pcie => "pcie",
            PmbusUnit::Hbm2 => "hbm2",
            PmbusUnit::Pcie2 => "pcie2",
        }
    }
}

/// Interconnect traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    /// Input side, exported as `rx`
    Rx,
    /// Target side, exported as `tx`
    Tx,
}

impl LinkDirection {
    pub const BOTH: [LinkDirection; 2] = [LinkDirection::Rx, LinkDirection::Tx];

    pub fn name(&self) -> &'static str {
        match self {
            LinkDirection::Rx => "rx",
            LinkDirection::Tx => "tx",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub tx: u64,
    pub rx: u64,
}

/// Correctable and uncorrectable AER counts of one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAer {
    pub ce: u64,
    pub ue: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccCounts {
    pub sram_ce: u64,
    pub sram_ue: u64,
    pub dram_ce: u64,
    pub dram_ue: u64,
    pub retired_page: u64,
}

/// A process holding one or more dies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// (device id, die id) pairs in use by the process
    pub dies: Vec<(u32, u32)>,
}

/// Identity and quota of one virtual partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub uuid: String,
    pub minor: u32,
    pub compute_quota: u32,
}

/// Partition memory in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Local server UUID and the UUIDs of connected remote servers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerUuids {
    pub local: String,
    pub remotes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PciEventKind {
    AerUe,
    AerCe,
    Synfld,
    Dbe,
    Mmio,
}

impl PciEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PciEventKind::AerUe => "aer_ue",
            PciEventKind::AerCe => "aer_ce",
            PciEventKind::Synfld => "synfld",
            PciEventKind::Dbe => "dbe",
            PciEventKind::Mmio => "mmio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciEvent {
    pub name: String,
    pub count: u64,
}

/// RAS error counters of one IP register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasErrorRegister {
    pub ip: String,
    pub index: u32,
    pub ue: u64,
    pub ce: u64,
}

/// RAS status word of one IP register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasStatusRegister {
    pub ip: String,
    pub index: u32,
    pub data: u64,
}

/// Optional library entry points, probed once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    InitWithFlags,
    DieCount,
    DieVersion,
    DieMemoryInfo,
    DieTemperature,
    DieIpUsage,
    DieClocks,
    DieDpmLevel,
    DiePmbus,
    DieThrottleReason,
    DeviceThrottleReason,
    LinkTrafficStat,
    LinkAer,
    LinkTopology,
    DieEcc,
    PartitionCount,
    RemoteUuids,
    PciEventInfo,
    DieUnavailableReason,
    DieRas,
    DeviceRas,
}

impl Capability {
    pub const ALL: [Capability; 21] = [
        Capability::InitWithFlags,
        Capability::DieCount,
        Capability::DieVersion,
        Capability::DieMemoryInfo,
        Capability::DieTemperature,
        Capability::DieIpUsage,
        Capability::DieClocks,
        Capability::DieDpmLevel,
        Capability::DiePmbus,
        Capability::DieThrottleReason,
        Capability::DeviceThrottleReason,
        Capability::LinkTrafficStat,
        Capability::LinkAer,
        Capability::LinkTopology,
        Capability::DieEcc,
        Capability::PartitionCount,
        Capability::RemoteUuids,
        Capability::PciEventInfo,
        Capability::DieUnavailableReason,
        Capability::DieRas,
        Capability::DeviceRas,
    ];
}

/// Raw binding to the vendor device-management library.
///
/// Methods guarded by a [`Capability`] are only called when
/// [`DeviceLibrary::capabilities`] reports that capability. Everything else is
/// present in every library version.
pub trait DeviceLibrary: Send + Sync {
    /// Optional entry points this library exposes
    fn capabilities(&self) -> HashSet<Capability>;

    fn init(&self) -> Query<()>;
    fn init_with_flags(&self, flags: u32) -> Query<()>;
    fn device_count(&self) -> u32;
    fn pf_device_count(&self) -> u32;
    fn device_info(&self, device: u32) -> Query<RawDeviceInfo>;
    fn die_count(&self, device: u32) -> Query<u32>;
    fn device_version(&self, device: u32, unit: VersionUnit) -> Query<String>;
    fn die_version(&self, device: u32, die: u32, unit: VersionUnit) -> Query<String>;
    fn link_topology(&self, device: u32) -> Query<LinkTopology>;

    fn memory_info(&self, device: u32) -> Query<MemoryInfo>;
    fn die_memory_info(&self, device: u32, die: u32) -> Query<MemoryInfo>;
    fn pcie_info(&self, device: u32) -> Query<PcieLink>;
    fn pcie_max_link_info(&self, device: u32) -> Query<PcieLink>;
    fn link_info(&self, device: u32) -> Query<LinkInfo>;

    /// Temperature in centi-degrees Celsius
    fn temperature(&self, device: u32, sensor: TemperatureSensor) -> Query<i32>;
    fn die_temperature(&self, device: u32, die: u32, sensor: TemperatureSensor) -> Query<i32>;
    /// Optical module temperatures in centi-degrees, one per module
    fn optical_module_temperatures(&self, device: u32) -> Query<Vec<i32>>;

    fn ip_usage(&self, device: u32, ip: UsageIp) -> Query<u32>;
    fn die_ip_usage(&self, device: u32, die: u32, ip: UsageIp) -> Query<u32>;

    /// Power of each board supply way
    fn board_power(&self, device: u32) -> Query<Vec<u32>>;
    fn pmbus_power(&self, device: u32, unit: PmbusUnit) -> Query<u32>;
    fn die_pmbus_power(&self, device: u32, die: u32, unit: PmbusUnit) -> Query<u32>;

    /// Clock frequencies in MHz, first entry is the current clock
    fn clocks(&self, device: u32, ip: ClockIp) -> Query<Vec<u32>>;
    fn die_clocks(&self, device: u32, die: u32, ip: ClockIp) -> Query<Vec<u32>>;

    fn pcie_throughput(&self, device: u32) -> Query<Throughput>;
    fn link_bandwidth(&self, device: u32, direction: LinkDirection) -> Query<Vec<u64>>;
    fn link_traffic(&self, device: u32, direction: LinkDirection) -> Query<Vec<u64>>;
    fn link_aer(&self, device: u32) -> Query<Vec<LinkAer>>;
    fn hbm_bandwidth(&self, device: u32, die: u32) -> Query<u64>;
    fn eth_throughput(&self, device: u32) -> Query<Throughput>;

    fn dpm_level(&self, device: u32, ip: DpmIp) -> Query<u32>;
    fn die_dpm_level(&self, device: u32, die: u32, ip: DpmIp) -> Query<u32>;

    fn processes(&self, device: u32, max: usize) -> Query<Vec<ProcessInfo>>;
    fn device_state(&self, device: u32) -> Query<i32>;
    fn die_unavailable_reason(&self, device: u32, die: u32) -> Query<String>;

    fn throttle_reason(&self, device: u32) -> Query<u64>;
    fn die_throttle_reason(&self, device: u32, die: u32) -> Query<u64>;
    fn die_ecc_counts(&self, device: u32, die: u32) -> Query<EccCounts>;

    /// Number of partitions on a device, negative when unavailable
    fn partition_count(&self, device: u32) -> i32;
    fn partition_info(&self, device: u32, partition: u32) -> Query<PartitionInfo>;
    fn partition_annotation(&self, device: u32, partition: u32) -> String;
    fn partition_usage(&self, device: u32, partition: u32) -> Query<u32>;
    fn partition_memory(&self, device: u32, partition: u32) -> Query<PartitionMemory>;

    fn server_uuids(&self) -> Query<ServerUuids>;
    fn pci_events(&self, device: u32, kind: PciEventKind) -> Query<Vec<PciEvent>>;

    fn ras_errors(&self, device: u32) -> Query<Vec<RasErrorRegister>>;
    fn die_ras_errors(&self, device: u32, die: u32) -> Query<Vec<RasErrorRegister>>;
    fn ras_status(&self, device: u32) -> Query<Vec<RasStatusRegister>>;
    fn die_ras_status(&self, device: u32, die: u32) -> Query<Vec<RasStatusRegister>>;
}

/// Which call variant a query resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Per-die entry point is present
    Die,
    /// Only the per-device entry point is present
    Device,
    /// Neither is present; the query reports not-supported
    Absent,
}

impl Scope {
    fn probe(caps: &HashSet<Capability>, die: Capability, device: Option<Capability>) -> Self {
        if caps.contains(&die) {
            Scope::Die
        } else {
            match device {
                Some(cap) if !caps.contains(&cap) => Scope::Absent,
                _ => Scope::Device,
            }
        }
    }
}

/// Fixed dispatch table negotiated from the library capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub init_with_flags: bool,
    pub die_count: bool,
    pub version: Scope,
    pub memory: Scope,
    pub temperature: Scope,
    pub ip_usage: Scope,
    pub clocks: Scope,
    pub dpm_level: Scope,
    pub pmbus: Scope,
    pub throttle_reason: Scope,
    pub ras: Scope,
    pub link_traffic: bool,
    pub link_aer: bool,
    pub link_topology: bool,
    pub ecc: bool,
    pub partition_count: bool,
    pub remote_uuids: bool,
    pub pci_events: bool,
    pub unavailable_reason: bool,
}

impl Dispatch {
    /// Negotiate the call variants for a capability set
    pub fn negotiate(caps: &HashSet<Capability>) -> Self {
        Self {
            init_with_flags: caps.contains(&Capability::InitWithFlags),
            die_count: caps.contains(&Capability::DieCount),
            version: Scope::probe(caps, Capability::DieVersion, None),
            memory: Scope::probe(caps, Capability::DieMemoryInfo, None),
            temperature: Scope::probe(caps, Capability::DieTemperature, None),
            ip_usage: Scope::probe(caps, Capability::DieIpUsage, None),
            clocks: Scope::probe(caps, Capability::DieClocks, None),
            dpm_level: Scope::probe(caps, Capability::DieDpmLevel, None),
            pmbus: Scope::probe(caps, Capability::DiePmbus, None),
            throttle_reason: Scope::probe(
                caps,
                Capability::DieThrottleReason,
                Some(Capability::DeviceThrottleReason),
            ),
            ras: Scope::probe(caps, Capability::DieRas, Some(Capability::DeviceRas)),
            link_traffic: caps.contains(&Capability::LinkTrafficStat),
            link_aer: caps.contains(&Capability::LinkAer),
            link_topology: caps.contains(&Capability::LinkTopology),
            ecc: caps.contains(&Capability::DieEcc),
            partition_count: caps.contains(&Capability::PartitionCount),
            remote_uuids: caps.contains(&Capability::RemoteUuids),
            pci_events: caps.contains(&Capability::PciEventInfo),
            unavailable_reason: caps.contains(&Capability::DieUnavailableReason),
        }
    }
}

/// Capability-negotiated query interface used by discovery and collection
#[derive(Clone)]
pub struct TelemetrySource {
    library: Arc<dyn DeviceLibrary>,
    dispatch: Dispatch,
    init_flags: u32,
}

impl TelemetrySource {
    /// Probe the library once and fix the dispatch table
    pub fn new(library: Arc<dyn DeviceLibrary>, init_flags: u32) -> Self {
        let dispatch = Dispatch::negotiate(&library.capabilities());
        info!("Negotiated device library dispatch: {:?}", dispatch);
        Self {
            library,
            dispatch,
            init_flags,
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn init(&self) -> Query<()> {
        if self.dispatch.init_with_flags {
            self.library.init_with_flags(self.init_flags)
        } else {
            self.library.init()
        }
    }

    pub fn device_count(&self) -> u32 {
        self.library.device_count()
    }

    pub fn pf_device_count(&self) -> u32 {
        self.library.pf_device_count()
    }

    pub fn device_info(&self, device: u32) -> Query<RawDeviceInfo> {
        self.library.device_info(device)
    }

    /// Libraries without the die-count entry point expose a single die
    pub fn die_count(&self, device: u32) -> Query<u32> {
        if self.dispatch.die_count {
            self.library.die_count(device)
        } else {
            Ok(1)
        }
    }

    pub fn version(&self, device: u32, die: u32, unit: VersionUnit) -> Query<String> {
        match self.dispatch.version {
            Scope::Die => self.library.die_version(device, die, unit),
            _ => self.library.device_version(device, unit),
        }
    }

    pub fn link_topology(&self, device: u32) -> Query<LinkTopology> {
        if self.dispatch.link_topology {
            self.library.link_topology(device)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn memory_info(&self, device: u32, die: u32) -> Query<MemoryInfo> {
        match self.dispatch.memory {
            Scope::Die => self.library.die_memory_info(device, die),
            _ => self.library.memory_info(device),
        }
    }

    pub fn pcie_info(&self, device: u32) -> Query<PcieLink> {
        self.library.pcie_info(device)
    }

    pub fn pcie_max_link_info(&self, device: u32) -> Query<PcieLink> {
        self.library.pcie_max_link_info(device)
    }

    pub fn link_info(&self, device: u32) -> Query<LinkInfo> {
        self.library.link_info(device)
    }

    pub fn device_temperature(&self, device: u32, sensor: TemperatureSensor) -> Query<i32> {
        self.library.temperature(device, sensor)
    }

    pub fn die_temperature(&self, device: u32, die: u32, sensor: TemperatureSensor) -> Query<i32> {
        match self.dispatch.temperature {
            Scope::Die => self.library.die_temperature(device, die, sensor),
            _ => self.library.temperature(device, sensor),
        }
    }

    pub fn optical_module_temperatures(&self, device: u32) -> Query<Vec<i32>> {
        self.library.optical_module_temperatures(device)
    }

    pub fn device_ip_usage(&self, device: u32, ip: UsageIp) -> Query<u32> {
        self.library.ip_usage(device, ip)
    }

    pub fn die_ip_usage(&self, device: u32, die: u32, ip: UsageIp) -> Query<u32> {
        match self.dispatch.ip_usage {
            Scope::Die => self.library.die_ip_usage(device, die, ip),
            _ => self.library.ip_usage(device, ip),
        }
    }

    pub fn board_power(&self, device: u32) -> Query<Vec<u32>> {
        self.library.board_power(device)
    }

    pub fn pmbus_power(&self, device: u32, die: u32, unit: PmbusUnit) -> Query<u32> {
        match self.dispatch.pmbus {
            Scope::Die => self.library.die_pmbus_power(device, die, unit),
            _ => self.library.pmbus_power(device, unit),
        }
    }

    pub fn device_clocks(&self, device: u32, ip: ClockIp) -> Query<Vec<u32>> {
        self.library.clocks(device, ip)
    }

    pub fn die_clocks(&self, device: u32, die: u32, ip: ClockIp) -> Query<Vec<u32>> {
        match self.dispatch.clocks {
            Scope::Die => self.library.die_clocks(device, die, ip),
            _ => self.library.clocks(device, ip),
        }
    }

    pub fn pcie_throughput(&self, device: u32) -> Query<Throughput> {
        self.library.pcie_throughput(device)
    }

    pub fn link_bandwidth(&self, device: u32, direction: LinkDirection) -> Query<Vec<u64>> {
        self.library.link_bandwidth(device, direction)
    }

    pub fn link_traffic(&self, device: u32, direction: LinkDirection) -> Query<Vec<u64>> {
        if self.dispatch.link_traffic {
            self.library.link_traffic(device, direction)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn link_aer(&self, device: u32) -> Query<Vec<LinkAer>> {
        if self.dispatch.link_aer {
            self.library.link_aer(device)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn hbm_bandwidth(&self, device: u32, die: u32) -> Query<u64> {
        self.library.hbm_bandwidth(device, die)
    }

    pub fn eth_throughput(&self, device: u32) -> Query<Throughput> {
        self.library.eth_throughput(device)
    }

    pub fn device_dpm_level(&self, device: u32, ip: DpmIp) -> Query<u32> {
        self.library.dpm_level(device, ip)
    }

    pub fn die_dpm_level(&self, device: u32, die: u32, ip: DpmIp) -> Query<u32> {
        match self.dispatch.dpm_level {
            Scope::Die => self.library.die_dpm_level(device, die, ip),
            _ => self.library.dpm_level(device, ip),
        }
    }

    pub fn processes(&self, device: u32, max: usize) -> Query<Vec<ProcessInfo>> {
        self.library.processes(device, max)
    }

    pub fn device_state(&self, device: u32) -> Query<i32> {
        self.library.device_state(device)
    }

    pub fn unavailable_reason(&self, device: u32, die: u32) -> Query<String> {
        if self.dispatch.unavailable_reason {
            self.library.die_unavailable_reason(device, die)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn throttle_reason(&self, device: u32, die: u32) -> Query<u64> {
        match self.dispatch.throttle_reason {
            Scope::Die => self.library.die_throttle_reason(device, die),
            Scope::Device => self.library.throttle_reason(device),
            Scope::Absent => Err(QueryStatus::NotSupported),
        }
    }

    pub fn ecc_counts(&self, device: u32, die: u32) -> Query<EccCounts> {
        if self.dispatch.ecc {
            self.library.die_ecc_counts(device, die)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    /// Partition count, `-1` when the library predates partitioning
    pub fn partition_count(&self, device: u32) -> i32 {
        if self.dispatch.partition_count {
            self.library.partition_count(device)
        } else {
            -1
        }
    }

    pub fn partition_info(&self, device: u32, partition: u32) -> Query<PartitionInfo> {
        self.library.partition_info(device, partition)
    }

    pub fn partition_annotation(&self, device: u32, partition: u32) -> String {
        self.library.partition_annotation(device, partition)
    }

    pub fn partition_usage(&self, device: u32, partition: u32) -> Query<u32> {
        self.library.partition_usage(device, partition)
    }

    pub fn partition_memory(&self, device: u32, partition: u32) -> Query<PartitionMemory> {
        self.library.partition_memory(device, partition)
    }

    pub fn server_uuids(&self) -> Query<ServerUuids> {
        if self.dispatch.remote_uuids {
            self.library.server_uuids()
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn pci_events(&self, device: u32, kind: PciEventKind) -> Query<Vec<PciEvent>> {
        if self.dispatch.pci_events {
            self.library.pci_events(device, kind)
        } else {
            Err(QueryStatus::NotSupported)
        }
    }

    pub fn ras_errors(&self, device: u32, die: u32) -> Query<Vec<RasErrorRegister>> {
        match self.dispatch.ras {
            Scope::Die => self.library.die_ras_errors(device, die),
            Scope::Device => self.library.ras_errors(device),
            Scope::Absent => Err(QueryStatus::NotSupported),
        }
    }

    pub fn ras_status(&self, device: u32, die: u32) -> Query<Vec<RasStatusRegister>> {
        match self.dispatch.ras {
            Scope::Die => self.library.die_ras_status(device, die),
            Scope::Device => self.library.ras_status(device),
            Scope::Absent => Err(QueryStatus::NotSupported),
        }
    }
}

impl std::fmt::Debug for TelemetrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySource")
            .field("dispatch", &self.dispatch)
            .field("init_flags", &self.init_flags)
            .finish()
    }
}

/// Library placeholder for builds without the vendor binding linked in.
///
/// Every query fails with [`QueryStatus::LoadLibraryFailure`], so a poller
/// driven by it stays in discovery and keeps retrying.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnloadedLibrary;

impl UnloadedLibrary {
    fn unavailable<T>(&self) -> Query<T> {
        debug!("Device library is not loaded");
        Err(QueryStatus::LoadLibraryFailure)
    }
}

impl DeviceLibrary for UnloadedLibrary {
    fn capabilities(&self) -> HashSet<Capability> {
        HashSet::new()
    }
    fn init(&self) -> Query<()> {
        self.unavailable()
    }
    fn init_with_flags(&self, _flags: u32) -> Query<()> {
        self.unavailable()
    }
    fn device_count(&self) -> u32 {
        0
    }
    fn pf_device_count(&self) -> u32 {
        0
    }
    fn device_info(&self, _device: u32) -> Query<RawDeviceInfo> {
        self.unavailable()
    }
    fn die_count(&self, _device: u32) -> Query<u32> {
        self.unavailable()
    }
    fn device_version(&self, _device: u32, _unit: VersionUnit) -> Query<String> {
        self.unavailable()
    }
    fn die_version(&self, _device: u32, _die: u32, _unit: VersionUnit) -> Query<String> {
        self.unavailable()
    }
    fn link_topology(&self, _device: u32) -> Query<LinkTopology> {
        self.unavailable()
    }
    fn memory_info(&self, _device: u32) -> Query<MemoryInfo> {
        self.unavailable()
    }
    fn die_memory_info(&self, _device: u32, _die: u32) -> Query<MemoryInfo> {
        self.unavailable()
    }
    fn pcie_info(&self, _device: u32) -> Query<PcieLink> {
        self.unavailable()
    }
    fn pcie_max_link_info(&self, _device: u32) -> Query<PcieLink> {
        self.unavailable()
    }
    fn link_info(&self, _device: u32) -> Query<LinkInfo> {
        self.unavailable()
    }
    fn temperature(&self, _device: u32, _sensor: TemperatureSensor) -> Query<i32> {
        self.unavailable()
    }
    fn die_temperature(&self, _device: u32, _die: u32, _sensor: TemperatureSensor) -> Query<i32> {
        self.unavailable()
    }
    fn optical_module_temperatures(&self, _device: u32) -> Query<Vec<i32>> {
        self.unavailable()
    }
    fn ip_usage(&self, _device: u32, _ip: UsageIp) -> Query<u32> {
        self.unavailable()
    }
    fn die_ip_usage(&self, _device: u32, _die: u32, _ip: UsageIp) -> Query<u32> {
        self.unavailable()
    }
    fn board_power(&self, _device: u32) -> Query<Vec<u32>> {
        self.unavailable()
    }
    fn pmbus_power(&self, _device: u32, _unit: PmbusUnit) -> Query<u32> {
        self.unavailable()
    }
    fn die_pmbus_power(&self, _device: u32, _die: u32, _unit: PmbusUnit) -> Query<u32> {
        self.unavailable()
    }
    fn clocks(&self, _device: u32, _ip: ClockIp) -> Query<Vec<u32>> {
        self.unavailable()
    }
    fn die_clocks(&self, _device: u32, _die: u32, _ip: ClockIp) -> Query<Vec<u32>> {
        self.unavailable()
    }
    fn pcie_throughput(&self, _device: u32) -> Query<Throughput> {
        self.unavailable()
    }
    fn link_bandwidth(&self, _device: u32, _direction: LinkDirection) -> Query<Vec<u64>> {
        self.unavailable()
    }
    fn link_traffic(&self, _device: u32, _direction: LinkDirection) -> Query<Vec<u64>> {
        self.unavailable()
    }
    fn link_aer(&self, _device: u32) -> Query<Vec<LinkAer>> {
        self.unavailable()
    }
    fn hbm_bandwidth(&self, _device: u32, _die: u32) -> Query<u64> {
        self.unavailable()
    }
    fn eth_throughput(&self, _device: u32) -> Query<Throughput> {
        self.unavailable()
    }
    fn dpm_level(&self, _device: u32, _ip: DpmIp) -> Query<u32> {
        self.unavailable()
    }
    fn die_dpm_level(&self, _device: u32, _die: u32, _ip: DpmIp) -> Query<u32> {
        self.unavailable()
    }
    fn processes(&self, _device: u32, _max: usize) -> Query<Vec<ProcessInfo>> {
        self.unavailable()
    }
    fn device_state(&self, _device: u32) -> Query<i32> {
        self.unavailable()
    }
    fn die_unavailable_reason(&self, _device: u32, _die: u32) -> Query<String> {
        self.unavailable()
    }
    fn throttle_reason(&self, _device: u32) -> Query<u64> {
        self.unavailable()
    }
    fn die_throttle_reason(&self, _device: u32, _die: u32) -> Query<u64> {
        self.unavailable()
    }
    fn die_ecc_counts(&self, _device: u32, _die: u32) -> Query<EccCounts> {
        self.unavailable()
    }
    fn partition_count(&self, _device: u32) -> i32 {
        -1
    }
    fn partition_info(&self, _device: u32, _partition: u32) -> Query<PartitionInfo> {
        self.unavailable()
    }
    fn partition_annotation(&self, _device: u32, _partition: u32) -> String {
        String::new()
    }
    fn partition_usage(&self, _device: u32, _partition: u32) -> Query<u32> {
        self.unavailable()
    }
    fn partition_memory(&self, _device: u32, _partition: u32) -> Query<PartitionMemory> {
        self.unavailable()
    }
    fn server_uuids(&self) -> Query<ServerUuids> {
        self.unavailable()
    }
    fn pci_events(&self, _device: u32, _kind: PciEventKind) -> Query<Vec<PciEvent>> {
        self.unavailable()
    }
    fn ras_errors(&self, _device: u32) -> Query<Vec<RasErrorRegister>> {
        self.unavailable()
    }
    fn die_ras_errors(&self, _device: u32, _die: u32) -> Query<Vec<RasErrorRegister>> {
        self.unavailable()
    }
    fn ras_status(&self, _device: u32) -> Query<Vec<RasStatusRegister>> {
        self.unavailable()
    }
    fn die_ras_status(&self, _device: u32, _die: u32) -> Query<Vec<RasStatusRegister>> {
        self.unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLibrary;

    #[test]
    fn test_status_code_mapping() {
        assert!(QueryStatus::check(0).is_ok());
        assert_eq!(QueryStatus::check(3), Err(QueryStatus::NotSupported));
        assert_eq!(QueryStatus::check(26), Err(QueryStatus::LoadLibraryFailure));
        assert_eq!(QueryStatus::check(11), Err(QueryStatus::Unknown(11)));
        assert!(QueryStatus::NotSupported.is_not_supported());
        assert!(!QueryStatus::NotSupported.is_systemic());
        assert!(QueryStatus::NoDevice.is_systemic());
    }

    #[test]
    fn test_dispatch_full_capabilities() {
        let caps: HashSet<Capability> = Capability::ALL.into_iter().collect();
        let dispatch = Dispatch::negotiate(&caps);
        assert!(dispatch.init_with_flags);
        assert_eq!(dispatch.temperature, Scope::Die);
        assert_eq!(dispatch.throttle_reason, Scope::Die);
        assert_eq!(dispatch.ras, Scope::Die);
        assert!(dispatch.ecc);
    }

    #[test]
    fn test_dispatch_legacy_library() {
        let dispatch = Dispatch::negotiate(&HashSet::new());
        assert!(!dispatch.init_with_flags);
        assert!(!dispatch.die_count);
        assert_eq!(dispatch.memory, Scope::Device);
        assert_eq!(dispatch.clocks, Scope::Device);
        assert_eq!(dispatch.throttle_reason, Scope::Absent);
        assert_eq!(dispatch.ras, Scope::Absent);

        let caps: HashSet<Capability> = [Capability::DeviceThrottleReason].into_iter().collect();
        assert_eq!(Dispatch::negotiate(&caps).throttle_reason, Scope::Device);
    }

    #[test]
    fn test_legacy_fallbacks() {
        let library = Arc::new(MockLibrary::new(1, 2).with_capabilities(HashSet::new()));
        let source = TelemetrySource::new(library.clone(), 1);

        assert_eq!(source.die_count(0), Ok(1));
        assert_eq!(source.partition_count(0), -1);
        assert_eq!(source.ecc_counts(0, 0), Err(QueryStatus::NotSupported));
        assert_eq!(source.throttle_reason(0, 0), Err(QueryStatus::NotSupported));
        assert_eq!(source.server_uuids(), Err(QueryStatus::NotSupported));

        // Per-die temperature falls back to the device-wide sensor
        assert_eq!(source.die_temperature(0, 1, TemperatureSensor::Hotspot), Ok(5000));
        assert_eq!(library.calls("temperature"), 1);
        assert_eq!(library.calls("die_temperature"), 0);

        source.init().unwrap();
        assert_eq!(library.calls("init"), 1);
        assert_eq!(library.calls("init_with_flags"), 0);
    }

    #[test]
    fn test_unloaded_library() {
        let source = TelemetrySource::new(Arc::new(UnloadedLibrary), 1);
        assert_eq!(source.init(), Err(QueryStatus::LoadLibraryFailure));
        assert_eq!(source.device_count(), 0);
        assert_eq!(source.die_count(0), Ok(1));
    }
}
