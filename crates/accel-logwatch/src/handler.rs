//! Regex pattern handlers
//!
//! Each handler owns one compiled pattern and a lock-guarded list of the
//! records it has parsed since the last drain.

use crate::record::{normalize_bdf, parse_eid, DriverEidError, KernelError, SdkEidError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, trace};

static KERNEL_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(METAX|MXGVM|MXCD)\.B([0-9A-F]{3,8})\.(?:D([0-9])\.)?(?:V[0-9]+\.)?([A-Z]{1,20})\.(ERROR|ALERT) (.+)",
    )
    .expect("Invalid kernel error regex")
});

static DRIVER_EID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\w+\.B\w+)(?:\.D([0-9]))?\.(?:.+) EID \((.+)\): ([^\W]+), (.+)")
        .expect("Invalid driver EID regex")
});

static SDK_EID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SDK\.([0-9]+)\.([^\.\n]+)\.(?:.+) EID \((.+)\): ([^\W]+), (.+)")
        .expect("Invalid SDK EID regex")
});

/// A record type that can be parsed from a regex match
pub trait LogPattern: Sized + Send + 'static {
    /// Short name used in diagnostics
    const NAME: &'static str;

    /// The compiled pattern for this record type
    fn pattern() -> &'static Regex;

    /// Build a record from one match, or `None` if a field fails to parse
    fn from_captures(captures: &Captures<'_>) -> Option<Self>;
}

fn group<'t>(captures: &Captures<'t>, index: usize) -> Option<&'t str> {
    captures.get(index).map(|m| m.as_str())
}

fn die_group(captures: &Captures<'_>, index: usize) -> Option<u32> {
    match group(captures, index) {
        Some(die) => die.parse().ok(),
        None => Some(0),
    }
}

impl LogPattern for KernelError {
    const NAME: &'static str = "kernel-error";

    fn pattern() -> &'static Regex {
        &KERNEL_ERROR_RE
    }

    fn from_captures(captures: &Captures<'_>) -> Option<Self> {
        Some(KernelError {
            module: group(captures, 1)?.to_string(),
            bdf: normalize_bdf(group(captures, 2)?)?,
            die_id: die_group(captures, 3)?,
            submodule: group(captures, 4)?.to_string(),
            level: group(captures, 5)?.to_string(),
            content: group(captures, 6)?.trim_end().to_string(),
        })
    }
}

impl LogPattern for DriverEidError {
    const NAME: &'static str = "driver-eid";

    fn pattern() -> &'static Regex {
        &DRIVER_EID_RE
    }

    fn from_captures(captures: &Captures<'_>) -> Option<Self> {
        Some(DriverEidError {
            die_id: die_group(captures, 1)?,
            bdf: group(captures, 2)?.to_string(),
            eid: parse_eid(group(captures, 3)?)?,
            info: group(captures, 4)?.trim_end().to_string(),
        })
    }
}

impl LogPattern for SdkEidError {
    const NAME: &'static str = "sdk-eid";

    fn pattern() -> &'static Regex {
        &SDK_EID_RE
    }

    fn from_captures(captures: &Captures<'_>) -> Option<Self> {
        Some(SdkEidError {
            sdk_version: group(captures, 1)?.parse().ok()?,
            module: group(captures, 2)?.to_string(),
            bdf: group(captures, 3)?.to_string(),
            eid: parse_eid(group(captures, 4)?)?,
            info: group(captures, 5)?.trim_end().to_string(),
        })
    }
}

/// Object-safe view of a handler, used by the tailer to dispatch new text
pub trait LogHandler: Send + Sync {
    /// Parse `text` and keep every match; returns the number of new records
    fn handle(&self, text: &str) -> usize;

    /// Handler name for diagnostics
    fn name(&self) -> &'static str;
}

/// Accumulates records of one pattern until they are drained
pub struct PatternHandler<T> {
    records: Mutex<Vec<T>>,
    _pattern: PhantomData<fn() -> T>,
}

impl<T: LogPattern> PatternHandler<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            _pattern: PhantomData,
        }
    }

    /// Atomically take every record parsed since the previous drain
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Number of records waiting to be drained
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: LogPattern> Default for PatternHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: LogPattern> LogHandler for PatternHandler<T> {
    fn handle(&self, text: &str) -> usize {
        let parsed: Vec<T> = T::pattern()
            .captures_iter(text)
            .filter_map(|captures| {
                let record = T::from_captures(&captures);
                if record.is_none() {
                    debug!(handler = T::NAME, line = &captures[0], "Unparseable log match");
                }
                record
            })
            .collect();

        let count = parsed.len();
        if count > 0 {
            trace!(handler = T::NAME, count, "Parsed log records");
            self.records.lock().extend(parsed);
        }
        count
    }

    fn name(&self) -> &'static str {
        T::NAME
    }
}

impl<T> fmt::Debug for PatternHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternHandler")
            .field("pending", &self.records.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_LINES: &str = "\
Jun 19 10:01:02 node kernel: [ 12.5] METAX.B4F00.D1.SMI.ERROR fence timeout on ring 3
Jun 19 10:01:03 node kernel: [ 12.6] MXGVM.B10108.V2.MMU.ALERT page fault at 0x1000
Jun 19 10:01:04 node kernel: [ 12.7] METAX.B4F00.SMI.INFO heartbeat ok
";

    #[test]
    fn test_kernel_error_parsing() {
        let handler = PatternHandler::<KernelError>::new();
        assert_eq!(handler.handle(KERNEL_LINES), 2);

        let records = handler.drain();
        assert_eq!(records[0].module, "METAX");
        assert_eq!(records[0].bdf, "0000:4f:00.0");
        assert_eq!(records[0].die_id, 1);
        assert_eq!(records[0].submodule, "SMI");
        assert_eq!(records[0].level, "ERROR");
        assert_eq!(records[0].content, "fence timeout on ring 3");

        assert_eq!(records[1].module, "MXGVM");
        assert_eq!(records[1].bdf, "0001:01:01.0");
        assert_eq!(records[1].die_id, 0);
        assert_eq!(records[1].submodule, "MMU");
        assert_eq!(records[1].level, "ALERT");
    }

    #[test]
    fn test_equal_records_are_kept_separately() {
        let handler = PatternHandler::<KernelError>::new();
        handler.handle("METAX.B4F00.SMI.ERROR first\n");
        handler.handle("METAX.B4F00.SMI.ERROR second\n");

        let records = handler.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], records[1]);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_driver_eid_parsing() {
        let handler = PatternHandler::<DriverEidError>::new();
        let text = "kernel: METAX.B4F00.D1.RAS EID (0000:4f:00.0): 0x2202, ECC uncorrectable\n\
                    kernel: METAX.B4F00.PCIE EID (0000:4f:00.0): 1a, link retrain\n";
        assert_eq!(handler.handle(text), 2);

        let records = handler.drain();
        assert_eq!(records[0].die_id, 1);
        assert_eq!(records[0].bdf, "0000:4f:00.0");
        assert_eq!(records[0].eid, 0x2202);
        assert_eq!(records[0].info, "ECC uncorrectable");
        assert_eq!(records[1].die_id, 0);
        assert_eq!(records[1].eid, 0x1a);
    }

    #[test]
    fn test_sdk_eid_parsing() {
        let handler = PatternHandler::<SdkEidError>::new();
        let text = "app[42]: SDK.20250619.UMD.queue EID (0000:01:01.0): 0x3104, Xnack Error\n";
        assert_eq!(handler.handle(text), 1);

        let records = handler.drain();
        assert_eq!(records[0].sdk_version, 20250619);
        assert_eq!(records[0].module, "UMD");
        assert_eq!(records[0].bdf, "0000:01:01.0");
        assert_eq!(records[0].eid, 0x3104);
        assert_eq!(records[0].info, "Xnack Error");
    }

    #[test]
    fn test_matching_does_not_cross_lines() {
        let handler = PatternHandler::<SdkEidError>::new();
        let text = "SDK.1.UMD.queue EID (0000:01:01.0): \n0x3104, Xnack Error\n";
        assert_eq!(handler.handle(text), 0);
    }

    #[test]
    fn test_drain_clears() {
        let handler = PatternHandler::<KernelError>::new();
        handler.handle("MXCD.B100.CORE.ERROR stuck\n");
        assert_eq!(handler.len(), 1);
        assert_eq!(handler.drain().len(), 1);
        assert!(handler.drain().is_empty());
    }
}
