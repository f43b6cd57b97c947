//! # accel-telemetry
//!
//! Accelerator telemetry collection engine.
//!
//! This crate provides:
//! - A capability-negotiated facade over the vendor device-management library
//! - Device, die and virtual partition topology discovery
//! - The static metric catalog with per-role and per-family applicability
//! - A lock-guarded metric store with per-namespace snapshots
//! - The polling state machine with de-support and generation rebuilds
//!
//! ## Example
//!
//! ```rust,no_run
//! use accel_telemetry::{Poller, PollerConfig, UnloadedLibrary};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = PollerConfig::new().with_interval(Duration::from_secs(10));
//! let mut poller = Poller::new(Arc::new(UnloadedLibrary), config).unwrap();
//!
//! // Blocks until two consecutive device-count reads agree
//! let supported = poller.initialize();
//! poller.set_required(supported.iter().map(|id| id.to_string()));
//!
//! let handle = poller.start().unwrap();
//! let store = handle.store();
//! println!("generation {}", store.generation());
//! ```

use thiserror::Error;

pub mod collect;
pub mod config;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod source;
pub mod store;
pub mod topology;

// Scripted library for tests and local runs
#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use collect::{CollectContext, Outcome};
pub use config::{DiscoveryLimits, PollerConfig};
pub use metrics::{EntityKey, MetricValue};
pub use poller::{CycleReport, Poller, PollerHandle, PollerState, PollerStats};
pub use registry::{Applicability, Collector, MetricDefinition, MetricRegistry};
pub use source::{Capability, DeviceLibrary, Dispatch, QueryStatus, TelemetrySource, UnloadedLibrary};
pub use store::{EntitySnapshot, MetricStore, Partition};
pub use topology::{DeviceRole, DieInfo, ProductFamily, Topology, TopologyDevice};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors that can occur while collecting accelerator telemetry
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Device library error: {0}")]
    Library(#[from] QueryStatus),

    #[error("Device ceiling exceeded: {0}")]
    CeilingExceeded(String),

    #[error("Inconsistent device count: first read {first}, second read {second}")]
    InconsistentCount { first: u32, second: u32 },

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    /// Check if this error should trigger a topology rediscovery
    pub fn needs_rediscovery(&self) -> bool {
        matches!(
            self,
            TelemetryError::CeilingExceeded(_) | TelemetryError::InconsistentCount { .. }
        ) || matches!(self, TelemetryError::Library(status) if status.is_systemic())
    }

    /// Check if this error indicates a configuration problem
    pub fn is_configuration_issue(&self) -> bool {
        matches!(
            self,
            TelemetryError::Configuration(_) | TelemetryError::UnknownMetric(_)
        )
    }
}
