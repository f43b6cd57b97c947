//! Label tuples attached to exported samples
//!
//! Every device and die gets one tuple per pod holding it, or a single tuple
//! with empty pod fields. Tuples are fitted to a family's label count by
//! padding with [`MISSING_LABEL`] or truncating.

use crate::pods::{registration_id, resolve_pods, PodInfo};
use accel_telemetry::{EntityKey, Partition, Topology};
use std::collections::HashMap;
use std::path::Path;

/// Value used for labels a tuple does not provide
pub const MISSING_LABEL: &str = "NA";

/// Fit `labels` to exactly `count` values
pub fn fit_labels(labels: &[String], count: usize) -> Vec<&str> {
    labels
        .iter()
        .map(String::as_str)
        .chain(std::iter::repeat(MISSING_LABEL))
        .take(count)
        .collect()
}

/// Label tuples for every entity of one scrape
#[derive(Debug, Clone, Default)]
pub struct LabelSets {
    entities: HashMap<EntityKey, Vec<Vec<String>>>,
}

impl LabelSets {
    /// Compute tuples for all devices, dies and partitions
    ///
    /// Die tuples are `[device id, uuid, pod, namespace, container, host,
    /// driver, bios, name, die id]`; device tuples omit the die id and come
    /// from the device's first die. Partition tuples are `[device id,
    /// partition id, minor, partition uuid, pod, namespace, container, host,
    /// driver, bios, name]`.
    pub fn build(
        topology: &Topology,
        partitions: &[Partition],
        pods: &HashMap<String, PodInfo>,
        register_dir: &Path,
        host: &str,
    ) -> Self {
        let mut entities: HashMap<EntityKey, Vec<Vec<String>>> = HashMap::new();

        for die in topology.dies() {
            let mut holders = resolve_pods(pods, register_dir, &die.uuid);
            if holders.is_empty() {
                holders.push(PodInfo::default());
            }

            let device_key = EntityKey::Device(die.device_id);
            let first_die = !entities.contains_key(&device_key);

            for pod in &holders {
                let tuple = vec![
                    die.device_id.to_string(),
                    die.uuid.clone(),
                    pod.pod_name.clone(),
                    pod.pod_namespace.clone(),
                    pod.container_name.clone(),
                    host.to_string(),
                    die.driver_version.clone(),
                    die.bios_version.clone(),
                    die.name.clone(),
                    die.die_id.to_string(),
                ];

                if first_die {
                    push_unique(
                        entities.entry(device_key).or_default(),
                        tuple[..tuple.len() - 1].to_vec(),
                    );
                }
                push_unique(
                    entities
                        .entry(EntityKey::Die(die.device_id, die.die_id))
                        .or_default(),
                    tuple,
                );
            }
        }

        for partition in partitions {
            let die = match topology
                .dies()
                .find(|die| die.device_id == partition.device_id)
            {
                Some(die) => die,
                None => continue,
            };

            let pod = lookup_partition_pod(pods, register_dir, partition);
            let tuple = vec![
                partition.device_id.to_string(),
                partition.partition_id.to_string(),
                partition.info.minor.to_string(),
                partition.info.uuid.clone(),
                pod.pod_name,
                pod.pod_namespace,
                pod.container_name,
                host.to_string(),
                die.driver_version.clone(),
                die.bios_version.clone(),
                die.name.clone(),
            ];
            entities.insert(
                EntityKey::Partition(partition.device_id, partition.partition_id),
                vec![tuple],
            );
        }

        Self { entities }
    }

    /// Tuples of an entity, empty when the entity is unknown
    pub fn get(&self, key: EntityKey) -> &[Vec<String>] {
        self.entities.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_device(&self, device_id: u32) -> bool {
        self.entities.contains_key(&EntityKey::Device(device_id))
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn push_unique(tuples: &mut Vec<Vec<String>>, tuple: Vec<String>) {
    if !tuples.contains(&tuple) {
        tuples.push(tuple);
    }
}

/// Pod of a partition, from its annotation or its registration file
fn lookup_partition_pod(
    pods: &HashMap<String, PodInfo>,
    register_dir: &Path,
    partition: &Partition,
) -> PodInfo {
    let register_id = if partition.annotation.is_empty() {
        registration_id(register_dir, &partition.info.uuid).unwrap_or_default()
    } else {
        partition.annotation.clone()
    };
    pods.get(&register_id).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_telemetry::mock::MockLibrary;
    use accel_telemetry::source::PartitionInfo;
    use accel_telemetry::topology::discover;
    use accel_telemetry::{DiscoveryLimits, TelemetrySource};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_short_tuple_is_padded() {
        let tuple = labels(&["0", "GPU-1", "trainer"]);
        assert_eq!(fit_labels(&tuple, 5), vec!["0", "GPU-1", "trainer", "NA", "NA"]);
    }

    #[test]
    fn test_long_tuple_is_truncated() {
        let tuple = labels(&["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(fit_labels(&tuple, 5), vec!["a", "b", "c", "d", "e"]);
        assert!(fit_labels(&tuple, 0).is_empty());
    }

    fn mock_topology(devices: u32, dies: u32) -> Topology {
        let library = Arc::new(MockLibrary::new(devices, dies));
        let source = TelemetrySource::new(library, 1);
        discover(&source, &DiscoveryLimits::default()).unwrap()
    }

    #[test]
    fn test_tuples_without_pods() {
        let topology = mock_topology(1, 2);
        let dir = TempDir::new().unwrap();
        let sets = LabelSets::build(&topology, &[], &HashMap::new(), dir.path(), "node-1");

        let uuid = topology.device(0).unwrap().uuid.as_str();
        assert_eq!(
            sets.get(EntityKey::Die(0, 1)),
            &[labels(&[
                "0", uuid, "", "", "", "node-1", "2.14.6", "1.22.0.0", "MXC500", "1"
            ])]
        );
        assert_eq!(sets.get(EntityKey::Device(0))[0].len(), 9);
        assert!(sets.contains_device(0));
    }

    #[test]
    fn test_oversubscribed_device_gets_one_tuple_per_pod() {
        let topology = mock_topology(1, 1);
        let dir = TempDir::new().unwrap();
        let uuid = topology.device(0).unwrap().uuid.clone();
        let pods: HashMap<String, PodInfo> = [
            (format!("{}::0", uuid), PodInfo::new("a", "ml", "main", "")),
            (format!("{}::1", uuid), PodInfo::new("b", "ml", "main", "")),
        ]
        .into();

        let sets = LabelSets::build(&topology, &[], &pods, dir.path(), "node-1");
        let tuples = sets.get(EntityKey::Die(0, 0));
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0][2], "a");
        assert_eq!(tuples[1][2], "b");
        assert_eq!(sets.get(EntityKey::Device(0)).len(), 2);
    }

    #[test]
    fn test_partition_tuple_uses_annotation() {
        let topology = mock_topology(1, 1);
        let dir = TempDir::new().unwrap();
        let partition = Partition {
            device_id: 0,
            partition_id: 3,
            info: PartitionInfo {
                uuid: "SGPU-3".to_string(),
                minor: 7,
                compute_quota: 50,
            },
            annotation: "reg-3".to_string(),
        };
        let pods: HashMap<String, PodInfo> =
            [("reg-3".to_string(), PodInfo::new("infer", "ml", "main", ""))].into();

        let sets = LabelSets::build(&topology, &[partition], &pods, dir.path(), "node-1");
        assert_eq!(
            sets.get(EntityKey::Partition(0, 3)),
            &[labels(&[
                "0", "3", "7", "SGPU-3", "infer", "ml", "main", "node-1", "2.14.6", "1.22.0.0",
                "MXC500"
            ])]
        );
    }

    #[test]
    fn test_unknown_entity_has_no_tuples() {
        let sets = LabelSets::default();
        assert!(sets.get(EntityKey::Die(0, 0)).is_empty());
        assert!(!sets.contains_device(0));
        assert!(sets.is_empty());
    }
}
