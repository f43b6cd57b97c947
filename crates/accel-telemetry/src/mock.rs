//! Mock device library for testing

use crate::source::*;
use crate::topology::PF_ID_BASE;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Scripted [`DeviceLibrary`] with call accounting and failure injection.
///
/// Native devices use ids `0..device_count`, physical functions use
/// `100..100 + pf_count`. Every query returns a fixed, realistic value unless
/// a failure has been injected for it by name.
pub struct MockLibrary {
    state: Mutex<MockState>,
}

struct MockState {
    capabilities: HashSet<Capability>,
    device_counts: VecDeque<u32>,
    last_device_count: u32,
    pf_count: u32,
    dies_per_device: u32,
    modes: HashMap<u32, VirtualizationMode>,
    brand: Brand,
    temperature: i32,
    link_info: LinkInfo,
    partitions: HashMap<u32, Vec<PartitionInfo>>,
    annotations: HashMap<(u32, u32), String>,
    failures: HashMap<String, QueryStatus>,
    one_shot_failures: HashMap<String, VecDeque<QueryStatus>>,
    calls: HashMap<String, usize>,
}

impl MockLibrary {
    /// Create a mock exposing `device_count` native devices with `dies_per_device` dies each
    pub fn new(device_count: u32, dies_per_device: u32) -> Self {
        let mut link_info = LinkInfo::default();
        link_info.speed[0] = 32.0;
        link_info.width[0] = 16;

        Self {
            state: Mutex::new(MockState {
                capabilities: Capability::ALL.into_iter().collect(),
                device_counts: VecDeque::new(),
                last_device_count: device_count,
                pf_count: 0,
                dies_per_device,
                modes: HashMap::new(),
                brand: Brand::C,
                temperature: 5000,
                link_info,
                partitions: HashMap::new(),
                annotations: HashMap::new(),
                failures: HashMap::new(),
                one_shot_failures: HashMap::new(),
                calls: HashMap::new(),
            }),
        }
    }

    /// Restrict the optional entry points the library exposes
    pub fn with_capabilities(self, capabilities: HashSet<Capability>) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    /// Script successive device-count reads; the last value repeats afterwards
    pub fn with_device_counts(self, counts: Vec<u32>) -> Self {
        {
            let mut state = self.state.lock();
            if let Some(last) = counts.last() {
                state.last_device_count = *last;
            }
            state.device_counts = counts.into();
        }
        self
    }

    pub fn with_pf_count(self, pf_count: u32) -> Self {
        self.state.lock().pf_count = pf_count;
        self
    }

    pub fn with_brand(self, brand: Brand) -> Self {
        self.state.lock().brand = brand;
        self
    }

    pub fn with_mode(self, device: u32, mode: VirtualizationMode) -> Self {
        self.state.lock().modes.insert(device, mode);
        self
    }

    /// Set the raw temperature in centi-degrees returned by every sensor
    pub fn with_temperature(self, centi_degrees: i32) -> Self {
        self.state.lock().temperature = centi_degrees;
        self
    }

    pub fn with_link_info(self, link_info: LinkInfo) -> Self {
        self.state.lock().link_info = link_info;
        self
    }

    pub fn with_partitions(self, device: u32, partitions: Vec<PartitionInfo>) -> Self {
        self.state.lock().partitions.insert(device, partitions);
        self
    }

    pub fn with_annotation(self, device: u32, partition: u32, annotation: &str) -> Self {
        self.state
            .lock()
            .annotations
            .insert((device, partition), annotation.to_string());
        self
    }

    /// Make every call to `method` fail with `status`
    pub fn fail(&self, method: &str, status: QueryStatus) {
        self.state.lock().failures.insert(method.to_string(), status);
    }

    /// Make the next call to `method` fail with `status`
    pub fn fail_once(&self, method: &str, status: QueryStatus) {
        self.state
            .lock()
            .one_shot_failures
            .entry(method.to_string())
            .or_default()
            .push_back(status);
    }

    /// Remove injected failures for `method`
    pub fn recover(&self, method: &str) {
        let mut state = self.state.lock();
        state.failures.remove(method);
        state.one_shot_failures.remove(method);
    }

    /// Change the device count reported from now on
    pub fn set_device_count(&self, count: u32) {
        let mut state = self.state.lock();
        state.device_counts.clear();
        state.last_device_count = count;
    }

    /// Number of times `method` has been called
    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, method: &str) -> Query<()> {
        let mut state = self.state.lock();
        *state.calls.entry(method.to_string()).or_insert(0) += 1;

        if let Some(queue) = state.one_shot_failures.get_mut(method) {
            if let Some(status) = queue.pop_front() {
                debug!("Mock library one-shot failure for {}: {}", method, status);
                return Err(status);
            }
        }
        match state.failures.get(method) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn known_device(&self, device: u32) -> Query<()> {
        let state = self.state.lock();
        let native = device < state.last_device_count;
        let pf = device >= PF_ID_BASE && device < PF_ID_BASE + state.pf_count;
        if native || pf {
            Ok(())
        } else {
            Err(QueryStatus::InvalidDeviceId)
        }
    }

    fn temperature_value(&self) -> i32 {
        self.state.lock().temperature
    }
}

impl DeviceLibrary for MockLibrary {
    fn capabilities(&self) -> HashSet<Capability> {
        self.state.lock().capabilities.clone()
    }

    fn init(&self) -> Query<()> {
        self.record("init")
    }

    fn init_with_flags(&self, _flags: u32) -> Query<()> {
        self.record("init_with_flags")
    }

    fn device_count(&self) -> u32 {
        let _ = self.record("device_count");
        let mut state = self.state.lock();
        match state.device_counts.pop_front() {
            Some(count) => count,
            None => state.last_device_count,
        }
    }

    fn pf_device_count(&self) -> u32 {
        let _ = self.record("pf_device_count");
        self.state.lock().pf_count
    }

    fn device_info(&self, device: u32) -> Query<RawDeviceInfo> {
        self.record("device_info")?;
        self.known_device(device)?;
        let state = self.state.lock();
        let mode = if device >= PF_ID_BASE {
            VirtualizationMode::Pf
        } else {
            state
                .modes
                .get(&device)
                .copied()
                .unwrap_or(VirtualizationMode::None)
        };
        Ok(RawDeviceInfo {
            device_id: device,
            mode,
            brand: state.brand,
            uuid: format!("GPU-{:08x}-mock", device),
            bdf: format!("0000:{:02x}:00.0", device + 1),
            name: "MXC500".to_string(),
        })
    }

    fn die_count(&self, device: u32) -> Query<u32> {
        self.record("die_count")?;
        self.known_device(device)?;
        Ok(self.state.lock().dies_per_device)
    }

    fn device_version(&self, _device: u32, unit: VersionUnit) -> Query<String> {
        self.record("device_version")?;
        Ok(match unit {
            VersionUnit::Driver => "2.14.6".to_string(),
            VersionUnit::Bios => "1.22.0.0".to_string(),
        })
    }

    fn die_version(&self, _device: u32, _die: u32, unit: VersionUnit) -> Query<String> {
        self.record("die_version")?;
        Ok(match unit {
            VersionUnit::Driver => "2.14.6".to_string(),
            VersionUnit::Bios => "1.22.0.0".to_string(),
        })
    }

    fn link_topology(&self, device: u32) -> Query<LinkTopology> {
        self.record("link_topology")?;
        Ok(LinkTopology {
            topology_id: 1,
            socket_id: (device % 2) as i32,
        })
    }

    fn memory_info(&self, _device: u32) -> Query<MemoryInfo> {
        self.record("memory_info")?;
        Ok(MemoryInfo {
            vram_total: 64 * 1024 * 1024,
            vram_used: 16 * 1024 * 1024,
            xtt_total: 0,
            xtt_used: 0,
        })
    }

    fn die_memory_info(&self, _device: u32, _die: u32) -> Query<MemoryInfo> {
        self.record("die_memory_info")?;
        Ok(MemoryInfo {
            vram_total: 64 * 1024 * 1024,
            vram_used: 16 * 1024 * 1024,
            xtt_total: 0,
            xtt_used: 0,
        })
    }

    fn pcie_info(&self, _device: u32) -> Query<PcieLink> {
        self.record("pcie_info")?;
        Ok(PcieLink { speed: 32.0, width: 16 })
    }

    fn pcie_max_link_info(&self, _device: u32) -> Query<PcieLink> {
        self.record("pcie_max_link_info")?;
        Ok(PcieLink { speed: 32.0, width: 16 })
    }

    fn link_info(&self, _device: u32) -> Query<LinkInfo> {
        self.record("link_info")?;
        Ok(self.state.lock().link_info)
    }

    fn temperature(&self, _device: u32, _sensor: TemperatureSensor) -> Query<i32> {
        self.record("temperature")?;
        Ok(self.temperature_value())
    }

    fn die_temperature(&self, _device: u32, _die: u32, _sensor: TemperatureSensor) -> Query<i32> {
        self.record("die_temperature")?;
        Ok(self.temperature_value())
    }

    fn optical_module_temperatures(&self, _device: u32) -> Query<Vec<i32>> {
        self.record("optical_module_temperatures")?;
        Ok(vec![4100, 4250])
    }

    fn ip_usage(&self, _device: u32, _ip: UsageIp) -> Query<u32> {
        self.record("ip_usage")?;
        Ok(40)
    }

    fn die_ip_usage(&self, _device: u32, _die: u32, _ip: UsageIp) -> Query<u32> {
        self.record("die_ip_usage")?;
        Ok(55)
    }

    fn board_power(&self, _device: u32) -> Query<Vec<u32>> {
        self.record("board_power")?;
        Ok(vec![120, 80, 30])
    }

    fn pmbus_power(&self, _device: u32, _unit: PmbusUnit) -> Query<u32> {
        self.record("pmbus_power")?;
        Ok(25)
    }

    fn die_pmbus_power(&self, _device: u32, _die: u32, unit: PmbusUnit) -> Query<u32> {
        self.record("die_pmbus_power")?;
        match unit {
            PmbusUnit::Hbm2 | PmbusUnit::Pcie2 => Err(QueryStatus::NotSupported),
            _ => Ok(25),
        }
    }

    fn clocks(&self, _device: u32, _ip: ClockIp) -> Query<Vec<u32>> {
        self.record("clocks")?;
        Ok(vec![1600, 800])
    }

    fn die_clocks(&self, _device: u32, _die: u32, _ip: ClockIp) -> Query<Vec<u32>> {
        self.record("die_clocks")?;
        Ok(vec![1800, 900])
    }

    fn pcie_throughput(&self, _device: u32) -> Query<Throughput> {
        self.record("pcie_throughput")?;
        Ok(Throughput { tx: 1200, rx: 3400 })
    }

    fn link_bandwidth(&self, _device: u32, direction: LinkDirection) -> Query<Vec<u64>> {
        self.record("link_bandwidth")?;
        Ok(match direction {
            LinkDirection::Rx => vec![10, 20],
            LinkDirection::Tx => vec![30, 40],
        })
    }

    fn link_traffic(&self, _device: u32, _direction: LinkDirection) -> Query<Vec<u64>> {
        self.record("link_traffic")?;
        Ok(vec![1_000_000, 2_000_000])
    }

    fn link_aer(&self, _device: u32) -> Query<Vec<LinkAer>> {
        self.record("link_aer")?;
        Ok(vec![LinkAer { ce: 1, ue: 0 }, LinkAer { ce: 0, ue: 2 }])
    }

    fn hbm_bandwidth(&self, _device: u32, _die: u32) -> Query<u64> {
        self.record("hbm_bandwidth")?;
        Ok(512)
    }

    fn eth_throughput(&self, _device: u32) -> Query<Throughput> {
        self.record("eth_throughput")?;
        Ok(Throughput { tx: 10, rx: 20 })
    }

    fn dpm_level(&self, _device: u32, _ip: DpmIp) -> Query<u32> {
        self.record("dpm_level")?;
        Ok(3)
    }

    fn die_dpm_level(&self, _device: u32, _die: u32, _ip: DpmIp) -> Query<u32> {
        self.record("die_dpm_level")?;
        Ok(4)
    }

    fn processes(&self, device: u32, _max: usize) -> Query<Vec<ProcessInfo>> {
        self.record("processes")?;
        Ok(vec![
            ProcessInfo { pid: 1001, dies: vec![(device, 0)] },
            ProcessInfo { pid: 1002, dies: vec![(device, 0), (device + 1, 0)] },
        ])
    }

    fn device_state(&self, _device: u32) -> Query<i32> {
        self.record("device_state")?;
        Ok(1)
    }

    fn die_unavailable_reason(&self, _device: u32, _die: u32) -> Query<String> {
        self.record("die_unavailable_reason")?;
        Ok(String::new())
    }

    fn throttle_reason(&self, _device: u32) -> Query<u64> {
        self.record("throttle_reason")?;
        Ok(0)
    }

    fn die_throttle_reason(&self, _device: u32, _die: u32) -> Query<u64> {
        self.record("die_throttle_reason")?;
        Ok(0x4)
    }

    fn die_ecc_counts(&self, _device: u32, _die: u32) -> Query<EccCounts> {
        self.record("die_ecc_counts")?;
        Ok(EccCounts {
            sram_ce: 1,
            ..EccCounts::default()
        })
    }

    fn partition_count(&self, device: u32) -> i32 {
        let _ = self.record("partition_count");
        self.state
            .lock()
            .partitions
            .get(&device)
            .map(|partitions| partitions.len() as i32)
            .unwrap_or(0)
    }

    fn partition_info(&self, device: u32, partition: u32) -> Query<PartitionInfo> {
        self.record("partition_info")?;
        self.state
            .lock()
            .partitions
            .get(&device)
            .and_then(|partitions| partitions.get(partition as usize).cloned())
            .ok_or(QueryStatus::NotSupported)
    }

    fn partition_annotation(&self, device: u32, partition: u32) -> String {
        let _ = self.record("partition_annotation");
        self.state
            .lock()
            .annotations
            .get(&(device, partition))
            .cloned()
            .unwrap_or_default()
    }

    fn partition_usage(&self, _device: u32, _partition: u32) -> Query<u32> {
        self.record("partition_usage")?;
        Ok(2500)
    }

    fn partition_memory(&self, _device: u32, _partition: u32) -> Query<PartitionMemory> {
        self.record("partition_memory")?;
        Ok(PartitionMemory {
            total: 8 * 1024 * 1024,
            used: 2 * 1024 * 1024,
            free: 6 * 1024 * 1024,
        })
    }

    fn server_uuids(&self) -> Query<ServerUuids> {
        self.record("server_uuids")?;
        Ok(ServerUuids {
            local: "server-local".to_string(),
            remotes: vec!["server-remote-a".to_string(), String::new()],
        })
    }

    fn pci_events(&self, _device: u32, kind: PciEventKind) -> Query<Vec<PciEvent>> {
        self.record("pci_events")?;
        Ok(vec![PciEvent {
            name: format!("{}_count", kind.name()),
            count: 0,
        }])
    }

    fn ras_errors(&self, _device: u32) -> Query<Vec<RasErrorRegister>> {
        self.record("ras_errors")?;
        Ok(Vec::new())
    }

    fn die_ras_errors(&self, _device: u32, _die: u32) -> Query<Vec<RasErrorRegister>> {
        self.record("die_ras_errors")?;
        Ok(vec![RasErrorRegister {
            ip: "MC".to_string(),
            index: 0,
            ue: 0,
            ce: 3,
        }])
    }

    fn ras_status(&self, _device: u32) -> Query<Vec<RasStatusRegister>> {
        self.record("ras_status")?;
        Ok(Vec::new())
    }

    fn die_ras_status(&self, _device: u32, _die: u32) -> Query<Vec<RasStatusRegister>> {
        self.record("die_ras_status")?;
        Ok(vec![RasStatusRegister {
            ip: "PCIE".to_string(),
            index: 1,
            data: 0x10,
        }])
    }
}
