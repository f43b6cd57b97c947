//! Device, die and role discovery

use crate::config::DiscoveryLimits;
use crate::source::{Brand, RawDeviceInfo, TelemetrySource, VersionUnit, VirtualizationMode};
use crate::{Result, TelemetryError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// First id of the physical-function device range
pub const PF_ID_BASE: u32 = 100;

/// Version string used when a version query fails
pub const UNKNOWN_VERSION: &str = "unknown";

/// Role a device slot plays under virtualization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    Native,
    PhysicalFunction,
    VirtualFunction,
}

impl DeviceRole {
    pub fn from_mode(mode: VirtualizationMode) -> Self {
        match mode {
            VirtualizationMode::None => DeviceRole::Native,
            VirtualizationMode::Pf => DeviceRole::PhysicalFunction,
            VirtualizationMode::Vf => DeviceRole::VirtualFunction,
        }
    }

    /// Suffix appended to the device name
    pub fn name_suffix(&self) -> &'static str {
        match self {
            DeviceRole::Native => "",
            DeviceRole::PhysicalFunction => " PF",
            DeviceRole::VirtualFunction => " VF",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Native => write!(f, "native"),
            DeviceRole::PhysicalFunction => write!(f, "pf"),
            DeviceRole::VirtualFunction => write!(f, "vf"),
        }
    }
}

/// Product family, selects which metrics are meaningful
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductFamily {
    FamilyN,
    FamilyC,
}

impl ProductFamily {
    pub fn from_brand(brand: Brand) -> Self {
        match brand {
            Brand::N => ProductFamily::FamilyN,
            _ => ProductFamily::FamilyC,
        }
    }
}

impl Default for ProductFamily {
    fn default() -> Self {
        ProductFamily::FamilyC
    }
}

impl fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductFamily::FamilyN => write!(f, "family-n"),
            ProductFamily::FamilyC => write!(f, "family-c"),
        }
    }
}

impl std::str::FromStr for ProductFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "family-n" | "n" => Ok(ProductFamily::FamilyN),
            "family-c" | "c" => Ok(ProductFamily::FamilyC),
            _ => Err(format!("Unknown product family: {}", s)),
        }
    }
}

/// One discovered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDevice {
    pub id: u32,
    pub role: DeviceRole,
    pub uuid: String,
    pub bdf: String,
    /// Library name plus role suffix
    pub name: String,
    pub die_count: u32,
}

/// Per-die identity and placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DieInfo {
    pub device_id: u32,
    pub die_id: u32,
    pub uuid: String,
    pub bdf: String,
    pub name: String,
    pub role: DeviceRole,
    pub driver_version: String,
    pub bios_version: String,
    /// Link topology id, `-1` when unknown
    pub topo_id: i32,
    /// Socket id, `-1` when unknown
    pub socket_id: i32,
}

/// Devices of one generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    devices: Vec<TopologyDevice>,
    dies: BTreeMap<(u32, u32), DieInfo>,
    bdf_index: HashMap<String, u32>,
    family: ProductFamily,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(&self) -> ProductFamily {
        self.family
    }

    pub fn devices(&self) -> &[TopologyDevice] {
        &self.devices
    }

    pub fn device(&self, id: u32) -> Option<&TopologyDevice> {
        self.devices.iter().find(|device| device.id == id)
    }

    /// Devices of one role in discovery order
    pub fn devices_with_role(&self, role: DeviceRole) -> impl Iterator<Item = &TopologyDevice> {
        self.devices.iter().filter(move |device| device.role == role)
    }

    pub fn dies(&self) -> impl Iterator<Item = &DieInfo> {
        self.dies.values()
    }

    pub fn die(&self, device_id: u32, die_id: u32) -> Option<&DieInfo> {
        self.dies.get(&(device_id, die_id))
    }

    /// Die ids of a device, empty for unknown devices
    pub fn die_range(&self, device_id: u32) -> std::ops::Range<u32> {
        0..self.device(device_id).map(|device| device.die_count).unwrap_or(0)
    }

    /// Resolve a normalized bus address to a device id
    pub fn device_for_bdf(&self, bdf: &str) -> Option<u32> {
        self.bdf_index.get(bdf).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Record a device and its dies; later entries replace the bus index and family
    pub fn insert(&mut self, device: TopologyDevice, dies: Vec<DieInfo>, brand: Brand) {
        self.bdf_index.insert(device.bdf.clone(), device.id);
        // Family follows the last device that reported dies
        if !dies.is_empty() {
            self.family = ProductFamily::from_brand(brand);
        }
        for die in dies {
            self.dies.insert((die.device_id, die.die_id), die);
        }
        self.devices.push(device);
    }
}

/// Enumerate native, PF and VF devices.
///
/// Aborts with [`TelemetryError::CeilingExceeded`] when either device count
/// is above its ceiling instead of enumerating a partial set.
pub fn discover(source: &TelemetrySource, limits: &DiscoveryLimits) -> Result<Topology> {
    let device_count = source.device_count();
    info!("Device count: {}", device_count);
    if device_count > limits.max_devices {
        return Err(TelemetryError::CeilingExceeded(format!(
            "{} devices reported, ceiling is {}",
            device_count, limits.max_devices
        )));
    }

    let pf_count = source.pf_device_count();
    info!("Physical function count: {}", pf_count);
    if pf_count > limits.max_pf_devices {
        return Err(TelemetryError::CeilingExceeded(format!(
            "{} physical functions reported, ceiling is {}",
            pf_count, limits.max_pf_devices
        )));
    }

    let mut topology = Topology::new();
    let ids = (0..device_count).chain(PF_ID_BASE..PF_ID_BASE + pf_count);
    for id in ids {
        let info = match source.device_info(id) {
            Ok(info) => info,
            Err(status) => {
                warn!("Device info query for device {} failed: {}", id, status);
                continue;
            }
        };
        let (device, dies) = describe_device(source, id, &info);
        debug!(
            "Discovered device {} ({}) role {} with {} dies",
            id, device.name, device.role, device.die_count
        );
        topology.insert(device, dies, info.brand);
    }

    info!(
        "Discovered {} devices, product family {}",
        topology.devices().len(),
        topology.family()
    );
    Ok(topology)
}

fn describe_device(
    source: &TelemetrySource,
    id: u32,
    info: &RawDeviceInfo,
) -> (TopologyDevice, Vec<DieInfo>) {
    let role = DeviceRole::from_mode(info.mode);
    let die_count = match source.die_count(id) {
        Ok(count) => count,
        Err(status) => {
            warn!("Die count query for device {} failed: {}", id, status);
            0
        }
    };
    let name = format!("{}{}", info.name, role.name_suffix());

    let (topo_id, socket_id) = match source.link_topology(id) {
        Ok(topology) => (topology.topology_id, topology.socket_id),
        Err(status) => {
            debug!("Link topology query for device {} failed: {}", id, status);
            (-1, -1)
        }
    };

    let dies = (0..die_count)
        .map(|die_id| DieInfo {
            device_id: id,
            die_id,
            uuid: info.uuid.clone(),
            bdf: info.bdf.clone(),
            name: name.clone(),
            role,
            driver_version: version_or_unknown(source, id, die_id, VersionUnit::Driver),
            bios_version: version_or_unknown(source, id, die_id, VersionUnit::Bios),
            topo_id,
            socket_id,
        })
        .collect();

    let device = TopologyDevice {
        id,
        role,
        uuid: info.uuid.clone(),
        bdf: info.bdf.clone(),
        name,
        die_count,
    };
    (device, dies)
}

fn version_or_unknown(source: &TelemetrySource, device: u32, die: u32, unit: VersionUnit) -> String {
    match source.version(device, die, unit) {
        Ok(version) => version,
        Err(status) => {
            warn!("{:?} version query for device {} failed: {}", unit, device, status);
            UNKNOWN_VERSION.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLibrary;
    use crate::source::QueryStatus;
    use std::sync::Arc;

    fn mock_source(library: MockLibrary) -> (Arc<MockLibrary>, TelemetrySource) {
        let library = Arc::new(library);
        let source = TelemetrySource::new(library.clone(), 1);
        (library, source)
    }

    #[test]
    fn test_discover_native_and_pf() {
        let (_, source) = mock_source(
            MockLibrary::new(2, 2)
                .with_pf_count(1)
                .with_mode(1, VirtualizationMode::Vf),
        );
        let topology = discover(&source, &DiscoveryLimits::default()).unwrap();

        assert_eq!(topology.devices().len(), 3);
        assert_eq!(topology.devices_with_role(DeviceRole::Native).count(), 1);
        assert_eq!(topology.devices_with_role(DeviceRole::VirtualFunction).count(), 1);

        let pf = topology.device(PF_ID_BASE).unwrap();
        assert_eq!(pf.role, DeviceRole::PhysicalFunction);
        assert_eq!(pf.name, "MXC500 PF");
        assert_eq!(topology.device(1).unwrap().name, "MXC500 VF");

        assert_eq!(topology.die_range(0), 0..2);
        let die = topology.die(0, 1).unwrap();
        assert_eq!(die.driver_version, "2.14.6");
        assert_eq!(die.topo_id, 1);
        assert_eq!(topology.device_for_bdf("0000:01:00.0"), Some(0));
        assert_eq!(topology.family(), ProductFamily::FamilyC);
    }

    #[test]
    fn test_discover_ceiling_exceeded() {
        let (_, source) = mock_source(MockLibrary::new(65, 1));
        let result = discover(&source, &DiscoveryLimits::default());
        assert!(matches!(result, Err(TelemetryError::CeilingExceeded(_))));

        let (library, source) = mock_source(MockLibrary::new(2, 1).with_pf_count(17));
        let result = discover(&source, &DiscoveryLimits::default());
        assert!(matches!(result, Err(TelemetryError::CeilingExceeded(_))));
        // Nothing is enumerated once a ceiling trips
        assert_eq!(library.calls("device_info"), 0);
    }

    #[test]
    fn test_discover_degraded_queries() {
        let (library, source) = mock_source(MockLibrary::new(3, 1));
        library.fail_once("device_info", QueryStatus::Failure);
        library.fail("die_count", QueryStatus::SysfsError);
        library.fail("link_topology", QueryStatus::NotSupported);

        let topology = discover(&source, &DiscoveryLimits::default()).unwrap();

        // The device whose identity query failed is skipped
        assert_eq!(topology.devices().len(), 2);
        assert!(topology.device(0).is_none());
        // Failing die count means zero dies, not an error
        assert_eq!(topology.device(1).unwrap().die_count, 0);
        assert_eq!(topology.dies().count(), 0);
    }

    #[test]
    fn test_discover_version_and_topology_fallbacks() {
        let (library, source) = mock_source(MockLibrary::new(1, 1));
        library.fail("die_version", QueryStatus::PermissionDenied);
        library.fail("link_topology", QueryStatus::NotSupported);

        let topology = discover(&source, &DiscoveryLimits::default()).unwrap();
        let die = topology.die(0, 0).unwrap();
        assert_eq!(die.driver_version, UNKNOWN_VERSION);
        assert_eq!(die.bios_version, UNKNOWN_VERSION);
        assert_eq!((die.topo_id, die.socket_id), (-1, -1));
    }

    #[test]
    fn test_family_from_last_device() {
        let (_, source) = mock_source(MockLibrary::new(2, 1).with_brand(Brand::N));
        let topology = discover(&source, &DiscoveryLimits::default()).unwrap();
        assert_eq!(topology.family(), ProductFamily::FamilyN);
        assert_eq!("family-n".parse::<ProductFamily>().unwrap(), ProductFamily::FamilyN);
        assert!("family-x".parse::<ProductFamily>().is_err());
    }
}
