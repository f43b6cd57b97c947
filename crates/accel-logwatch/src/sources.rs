//! Kernel and system log sources

use crate::handler::{LogHandler, PatternHandler};
use crate::record::{DriverEidError, KernelError, SdkEidError};
use crate::tailer::{LogTailer, TailerConfig, TailerHandle};
use crate::Result;
use std::path::Path;
use std::sync::Arc;

/// A log source that advertises the metric ids it can produce
pub trait LogSource {
    /// Short source name, also used for the thread name
    fn name(&self) -> &'static str;

    /// Metric ids fed by this source
    fn supported_metrics(&self) -> &'static [&'static str];

    /// Files searched under the mount point, first match wins
    fn candidates(&self) -> &'static [&'static str];
}

/// Driver messages from the kernel log
#[derive(Debug)]
pub struct KernelLogWatch {
    config: TailerConfig,
    kernel_errors: Arc<PatternHandler<KernelError>>,
    driver_eids: Arc<PatternHandler<DriverEidError>>,
}

impl KernelLogWatch {
    pub const CANDIDATES: &'static [&'static str] = &["var/log/messages", "var/log/kern.log"];
    pub const SUPPORTED_METRICS: &'static [&'static str] =
        &["driver_eid_errors", "driver_log_errors"];

    pub fn new(config: TailerConfig) -> Self {
        Self {
            config,
            kernel_errors: Arc::new(PatternHandler::new()),
            driver_eids: Arc::new(PatternHandler::new()),
        }
    }

    /// Start tailing; `explicit` overrides the candidate search
    pub fn start(&self, mount_point: &Path, explicit: Option<&Path>) -> Result<TailerHandle> {
        LogTailer::new(self.name(), self.candidates(), self.config.clone())
            .with_handler(self.kernel_errors.clone() as Arc<dyn LogHandler>)
            .with_handler(self.driver_eids.clone() as Arc<dyn LogHandler>)
            .start(mount_point, explicit)
    }

    /// Parse text as if it had been appended to the log
    pub fn feed(&self, text: &str) -> usize {
        self.kernel_errors.handle(text) + self.driver_eids.handle(text)
    }

    pub fn drain_kernel_errors(&self) -> Vec<KernelError> {
        self.kernel_errors.drain()
    }

    pub fn drain_driver_eids(&self) -> Vec<DriverEidError> {
        self.driver_eids.drain()
    }
}

impl LogSource for KernelLogWatch {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn supported_metrics(&self) -> &'static [&'static str] {
        Self::SUPPORTED_METRICS
    }

    fn candidates(&self) -> &'static [&'static str] {
        Self::CANDIDATES
    }
}

/// SDK messages from the system log
#[derive(Debug)]
pub struct SysLogWatch {
    config: TailerConfig,
    sdk_eids: Arc<PatternHandler<SdkEidError>>,
}

impl SysLogWatch {
    pub const CANDIDATES: &'static [&'static str] = &["var/log/syslog", "var/log/messages"];
    pub const SUPPORTED_METRICS: &'static [&'static str] = &["sdk_eid_errors"];

    pub fn new(config: TailerConfig) -> Self {
        Self {
            config,
            sdk_eids: Arc::new(PatternHandler::new()),
        }
    }

    /// Start tailing; `explicit` overrides the candidate search
    pub fn start(&self, mount_point: &Path, explicit: Option<&Path>) -> Result<TailerHandle> {
        LogTailer::new(self.name(), self.candidates(), self.config.clone())
            .with_handler(self.sdk_eids.clone() as Arc<dyn LogHandler>)
            .start(mount_point, explicit)
    }

    /// Parse text as if it had been appended to the log
    pub fn feed(&self, text: &str) -> usize {
        self.sdk_eids.handle(text)
    }

    pub fn drain_sdk_eids(&self) -> Vec<SdkEidError> {
        self.sdk_eids.drain()
    }
}

impl LogSource for SysLogWatch {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn supported_metrics(&self) -> &'static [&'static str] {
        Self::SUPPORTED_METRICS
    }

    fn candidates(&self) -> &'static [&'static str] {
        Self::CANDIDATES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::TailerStatus;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fast_config() -> TailerConfig {
        TailerConfig::new().with_poll_interval(Duration::from_millis(10))
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_source_metadata() {
        let kernel = KernelLogWatch::new(TailerConfig::default());
        assert_eq!(kernel.name(), "kernel");
        assert_eq!(
            kernel.supported_metrics(),
            &["driver_eid_errors", "driver_log_errors"]
        );

        let syslog = SysLogWatch::new(TailerConfig::default());
        assert_eq!(syslog.supported_metrics(), &["sdk_eid_errors"]);
        assert_eq!(syslog.candidates()[0], "var/log/syslog");
    }

    #[test]
    fn test_kernel_watch_feeds_both_handlers() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("var/log");
        fs::create_dir_all(&log).unwrap();
        let path = log.join("kern.log");
        fs::write(&path, "boot\n").unwrap();

        let watch = KernelLogWatch::new(fast_config());
        let mut handle = watch.start(dir.path(), None).unwrap();
        assert_eq!(handle.status(), TailerStatus::Running(path.clone()));

        append(
            &path,
            "METAX.B4F00.D1.SMI.ERROR fence timeout\n\
             METAX.B4F00.D1.RAS EID (0000:4f:00.0): 0x2202, ECC uncorrectable\n",
        );

        let mut kernel_errors = Vec::new();
        let mut driver_eids = Vec::new();
        assert!(eventually(|| {
            kernel_errors.extend(watch.drain_kernel_errors());
            driver_eids.extend(watch.drain_driver_eids());
            !kernel_errors.is_empty() && !driver_eids.is_empty()
        }));
        handle.stop().unwrap();

        assert_eq!(kernel_errors.len(), 1);
        assert_eq!(kernel_errors[0].submodule, "SMI");
        assert_eq!(driver_eids.len(), 1);
        assert_eq!(driver_eids[0].eid, 0x2202);
    }

    #[test]
    fn test_feed_without_tailing() {
        let watch = SysLogWatch::new(TailerConfig::default());
        let text = "SDK.20250619.UMD.queue EID (0000:01:00.0): 0x3104, Xnack Error\n";
        assert_eq!(watch.feed(text), 1);
        assert_eq!(watch.drain_sdk_eids()[0].eid, 0x3104);
    }

    #[test]
    fn test_syslog_watch_without_file() {
        let dir = TempDir::new().unwrap();
        let watch = SysLogWatch::new(fast_config());
        let handle = watch.start(dir.path(), None).unwrap();

        assert_eq!(handle.status(), TailerStatus::Unavailable);
        assert!(watch.drain_sdk_eids().is_empty());
    }
}
