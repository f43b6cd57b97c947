//! Metric values and the entity keys they are stored under

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of the entity a metric value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    /// Whole device
    Device(u32),
    /// (device id, die id)
    Die(u32, u32),
    /// (device id, partition id)
    Partition(u32, u32),
}

impl EntityKey {
    pub fn device_id(&self) -> u32 {
        match self {
            EntityKey::Device(device) => *device,
            EntityKey::Die(device, _) => *device,
            EntityKey::Partition(device, _) => *device,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Device(device) => write!(f, "device {}", device),
            EntityKey::Die(device, die) => write!(f, "device {} die {}", device, die),
            EntityKey::Partition(device, partition) => {
                write!(f, "device {} partition {}", device, partition)
            }
        }
    }
}

/// A collected value: a number, or a mapping keyed by link, unit or field name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Nested(BTreeMap<String, MetricValue>),
}

impl MetricValue {
    pub fn scalar(value: impl Into<f64>) -> Self {
        MetricValue::Scalar(value.into())
    }

    /// Build a single-level mapping
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: ToString,
        V: Into<f64>,
        I: IntoIterator<Item = (K, V)>,
    {
        MetricValue::Nested(
            pairs
                .into_iter()
                .map(|(key, value)| (key.to_string(), MetricValue::Scalar(value.into())))
                .collect(),
        )
    }

    /// Build a two-level mapping from named inner mappings
    pub fn from_groups<K, I>(groups: I) -> Self
    where
        K: ToString,
        I: IntoIterator<Item = (K, MetricValue)>,
    {
        MetricValue::Nested(
            groups
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(value) => Some(*value),
            MetricValue::Nested(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        match self {
            MetricValue::Nested(map) => map.get(key),
            MetricValue::Scalar(_) => None,
        }
    }

    /// Flatten into (key path, value) samples, outer keys first
    pub fn samples(&self) -> Vec<(Vec<&str>, f64)> {
        let mut out = Vec::new();
        self.collect_samples(&mut Vec::new(), &mut out);
        out
    }

    fn collect_samples<'a>(&'a self, path: &mut Vec<&'a str>, out: &mut Vec<(Vec<&'a str>, f64)>) {
        match self {
            MetricValue::Scalar(value) => out.push((path.clone(), *value)),
            MetricValue::Nested(map) => {
                for (key, value) in map {
                    path.push(key.as_str());
                    value.collect_samples(path, out);
                    path.pop();
                }
            }
        }
    }
}
