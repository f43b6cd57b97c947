//! Poller configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sanity ceilings applied during topology discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryLimits {
    /// Maximum native or PF-capable device slots
    pub max_devices: u32,

    /// Maximum physical-function devices
    pub max_pf_devices: u32,

    /// Maximum virtual partitions enumerated per device
    pub max_partitions: u32,

    /// Maximum processes fetched per device
    pub max_processes: usize,
}

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Target time between the starts of two collection cycles
    pub interval: Duration,

    /// Wait between the two device-count reads of the consistency check
    pub settle_delay: Duration,

    /// Wait before retrying a failed consistency check
    pub retry_backoff: Duration,

    /// Flags passed to the flagged library initializer
    pub init_flags: u32,

    /// Discovery ceilings
    pub limits: DiscoveryLimits,
}

impl PollerConfig {
    /// Create a configuration with production defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the collection interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the settle delay of the double-read check
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the retry backoff of the double-read check
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the discovery ceilings
    pub fn with_limits(mut self, limits: DiscoveryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("Collection interval must be greater than zero".to_string());
        }

        if self.limits.max_devices == 0 {
            return Err("Device ceiling must be greater than zero".to_string());
        }

        if self.limits.max_partitions == 0 {
            return Err("Partition ceiling must be greater than zero".to_string());
        }

        if self.limits.max_processes == 0 {
            return Err("Process ceiling must be greater than zero".to_string());
        }

        Ok(())
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(30),
            init_flags: 1,
            limits: DiscoveryLimits::default(),
        }
    }
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_devices: 64,
            max_pf_devices: 16,
            max_partitions: 16,
            max_processes: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poller_config_defaults() {
        let config = PollerConfig::new();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.settle_delay, Duration::from_secs(30));
        assert_eq!(config.limits.max_devices, 64);
        assert_eq!(config.limits.max_pf_devices, 16);
        assert_eq!(config.limits.max_partitions, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poller_config_builder() {
        let config = PollerConfig::new()
            .with_interval(Duration::from_millis(500))
            .with_settle_delay(Duration::from_millis(1))
            .with_retry_backoff(Duration::from_millis(2));

        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.settle_delay, Duration::from_millis(1));
        assert_eq!(config.retry_backoff, Duration::from_millis(2));
    }

    #[test]
    fn test_poller_config_validation() {
        let config = PollerConfig::new().with_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let limits = DiscoveryLimits {
            max_partitions: 0,
            ..DiscoveryLimits::default()
        };
        assert!(PollerConfig::new().with_limits(limits).validate().is_err());
    }

    #[test]
    fn test_poller_config_serialization() {
        let config = PollerConfig::new().with_interval(Duration::from_secs(5));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PollerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(5));
        assert_eq!(parsed.limits, DiscoveryLimits::default());
    }
}
