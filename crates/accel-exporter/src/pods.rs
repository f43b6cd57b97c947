//! Pod-resource correlation
//!
//! A [`PodResourceLookup`] maps device-plugin device ids to the pod holding
//! them. Device ids are either a device UUID, a partition registration id, or
//! `<uuid>::<index>` when a device is oversubscribed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pod holding a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PodInfo {
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
    pub device_id: String,
}

impl PodInfo {
    pub fn new(
        pod_name: impl Into<String>,
        pod_namespace: impl Into<String>,
        container_name: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            pod_name: pod_name.into(),
            pod_namespace: pod_namespace.into(),
            container_name: container_name.into(),
            device_id: device_id.into(),
        }
    }
}

/// Source of the device id to pod map
pub trait PodResourceLookup: Send + Sync {
    /// Current assignments; an unreachable service yields an empty map
    fn list(&self) -> HashMap<String, PodInfo>;
}

/// Lookup used when no orchestrator is present
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPodResources;

impl PodResourceLookup for NoPodResources {
    fn list(&self) -> HashMap<String, PodInfo> {
        HashMap::new()
    }
}

/// Fixed in-memory assignments
#[derive(Debug, Clone, Default)]
pub struct StaticPodResources {
    pods: HashMap<String, PodInfo>,
}

impl StaticPodResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `device_id` to a pod
    pub fn with_pod(mut self, device_id: impl Into<String>, pod: PodInfo) -> Self {
        self.pods.insert(device_id.into(), pod);
        self
    }
}

impl PodResourceLookup for StaticPodResources {
    fn list(&self) -> HashMap<String, PodInfo> {
        self.pods.clone()
    }
}

/// Assignments read from a YAML map of device id to [`PodInfo`] on every call
#[derive(Debug, Clone)]
pub struct FilePodResources {
    path: PathBuf,
}

impl FilePodResources {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PodResourceLookup for FilePodResources {
    fn list(&self) -> HashMap<String, PodInfo> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!("Pod resource file {} unavailable: {}", self.path.display(), e);
                return HashMap::new();
            }
        };

        match serde_yaml::from_str::<HashMap<String, PodInfo>>(&content) {
            Ok(mut pods) => {
                for (device_id, pod) in pods.iter_mut() {
                    if pod.device_id.is_empty() {
                        pod.device_id = device_id.clone();
                    }
                }
                pods
            }
            Err(e) => {
                warn!("Failed to parse pod resource file {}: {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }
}

/// Read the `id` entry of a device-plugin registration file
///
/// The file holds `;`-separated `key=value` pairs. A missing file, unreadable
/// file, or absent key all give `None`.
pub fn registration_id(register_dir: &Path, uuid: &str) -> Option<String> {
    if uuid.is_empty() {
        return None;
    }

    let content = fs::read_to_string(register_dir.join(uuid)).ok()?;
    content
        .trim()
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == "id")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Pods holding a device, in resolution order
///
/// Tries a direct hit on the device UUID, then the device-plugin registration
/// id, then every oversubscription entry whose key contains the UUID.
pub fn resolve_pods(
    pods: &HashMap<String, PodInfo>,
    register_dir: &Path,
    uuid: &str,
) -> Vec<PodInfo> {
    if let Some(pod) = pods.get(uuid) {
        return vec![pod.clone()];
    }
    if uuid.is_empty() {
        return Vec::new();
    }

    if let Some(id) = registration_id(register_dir, uuid) {
        return pods.get(&id).cloned().into_iter().collect();
    }

    let mut keys: Vec<&String> = pods.keys().filter(|key| key.contains(uuid)).collect();
    keys.sort();
    keys.into_iter().map(|key| pods[key].clone()).collect()
}
