//! Concurrently read metric store
//!
//! One mutex guards every namespace. Writers hold it for a single key update,
//! readers hold it only while cloning one namespace, so a snapshot never
//! contains a half-written value but may mix values from two cycles.

use crate::metrics::{EntityKey, MetricValue};
use crate::source::PartitionInfo;
use crate::topology::Topology;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Metric values per entity, keyed by metric id
pub type EntitySnapshot = BTreeMap<EntityKey, BTreeMap<String, MetricValue>>;

/// A virtual partition enumerated during the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub device_id: u32,
    pub partition_id: u32,
    pub info: PartitionInfo,
    /// Pod registration id the orchestrator attached to the partition
    pub annotation: String,
}

#[derive(Debug, Default)]
struct StoreInner {
    generation: u64,
    topology: Arc<Topology>,
    devices: EntitySnapshot,
    partitions: EntitySnapshot,
    partition_info: BTreeMap<(u32, u32), Partition>,
    server: BTreeMap<String, MetricValue>,
}

/// Shared store written by the poller and read by exporters
#[derive(Debug, Default)]
pub struct MetricStore {
    inner: Mutex<StoreInner>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one metric value for a device, die or partition
    pub fn update(&self, key: EntityKey, metric: &str, value: MetricValue) {
        let mut inner = self.inner.lock();
        let namespace = match key {
            EntityKey::Partition(..) => &mut inner.partitions,
            _ => &mut inner.devices,
        };
        namespace
            .entry(key)
            .or_default()
            .insert(metric.to_string(), value);
    }

    pub fn update_server(&self, metric: &str, value: MetricValue) {
        self.inner.lock().server.insert(metric.to_string(), value);
    }

    pub fn insert_partition(&self, partition: Partition) {
        self.inner
            .lock()
            .partition_info
            .insert((partition.device_id, partition.partition_id), partition);
    }

    /// Device and die values
    pub fn snapshot(&self) -> EntitySnapshot {
        self.inner.lock().devices.clone()
    }

    pub fn snapshot_partitions(&self) -> EntitySnapshot {
        self.inner.lock().partitions.clone()
    }

    pub fn snapshot_server(&self) -> BTreeMap<String, MetricValue> {
        self.inner.lock().server.clone()
    }

    /// Partitions enumerated by the latest cycle
    pub fn partitions(&self) -> Vec<Partition> {
        self.inner.lock().partition_info.values().cloned().collect()
    }

    /// Value of one metric for one entity
    pub fn get(&self, key: EntityKey, metric: &str) -> Option<MetricValue> {
        let inner = self.inner.lock();
        let namespace = match key {
            EntityKey::Partition(..) => &inner.partitions,
            _ => &inner.devices,
        };
        namespace.get(&key).and_then(|values| values.get(metric)).cloned()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.inner.lock().topology.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Drop partition values and identities ahead of re-enumeration
    pub fn clear_partitions(&self) {
        let mut inner = self.inner.lock();
        inner.partitions.clear();
        inner.partition_info.clear();
    }

    pub fn clear_server(&self) {
        self.inner.lock().server.clear();
    }

    /// Start a new generation: discard every value and install the new topology
    pub fn reset_generation(&self, topology: Arc<Topology>) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.topology = topology;
        inner.devices.clear();
        inner.partitions.clear();
        inner.partition_info.clear();
        inner.server.clear();
        debug!("Metric store reset to generation {}", inner.generation);
        inner.generation
    }
}
