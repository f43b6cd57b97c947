//! Parsed log records
//!
//! Two records are equal when they describe the same error on the same die.
//! The free-form message text never takes part in equality or hashing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Normalize a packed hexadecimal bus token such as `4F00` to `0000:4f:00.0`
pub fn normalize_bdf(token: &str) -> Option<String> {
    let value = u32::from_str_radix(token, 16).ok()?;
    Some(format!(
        "{:04x}:{:02x}:{:02x}.{:x}",
        value >> 16,
        (value & 0xffff) >> 8,
        (value & 0xff) >> 3,
        value & 0x7
    ))
}

/// Parse an error id written as `0x2202` or `2202`
pub(crate) fn parse_eid(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

/// Kernel driver message logged at ERROR or ALERT level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelError {
    /// Driver module tag (`METAX`, `MXGVM`, `MXCD`)
    pub module: String,
    pub bdf: String,
    pub die_id: u32,
    pub submodule: String,
    pub level: String,
    pub content: String,
}

impl PartialEq for KernelError {
    fn eq(&self, other: &Self) -> bool {
        (&self.bdf, self.die_id, &self.submodule, &self.level)
            == (&other.bdf, other.die_id, &other.submodule, &other.level)
    }
}

impl Eq for KernelError {}

impl Hash for KernelError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bdf.hash(state);
        self.die_id.hash(state);
        self.submodule.hash(state);
        self.level.hash(state);
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} die {} {}.{}: {}",
            self.module, self.bdf, self.die_id, self.submodule, self.level, self.content
        )
    }
}

/// Driver error carrying an event id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverEidError {
    pub bdf: String,
    pub die_id: u32,
    pub eid: u64,
    /// Short description following the event id
    pub info: String,
}

impl PartialEq for DriverEidError {
    fn eq(&self, other: &Self) -> bool {
        (&self.bdf, self.die_id, self.eid) == (&other.bdf, other.die_id, other.eid)
    }
}

impl Eq for DriverEidError {}

impl Hash for DriverEidError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bdf.hash(state);
        self.die_id.hash(state);
        self.eid.hash(state);
    }
}

impl fmt::Display for DriverEidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EID {:#x} on {} die {}: {}", self.eid, self.bdf, self.die_id, self.info)
    }
}

/// User-space SDK error carrying an event id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkEidError {
    pub sdk_version: u64,
    pub module: String,
    pub bdf: String,
    pub eid: u64,
    pub info: String,
}

impl SdkEidError {
    /// SDK records are not die specific and always map to die 0
    pub fn die_id(&self) -> u32 {
        0
    }
}

impl PartialEq for SdkEidError {
    fn eq(&self, other: &Self) -> bool {
        (self.sdk_version, &self.bdf, self.eid) == (other.sdk_version, &other.bdf, other.eid)
    }
}

impl Eq for SdkEidError {}

impl Hash for SdkEidError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sdk_version.hash(state);
        self.bdf.hash(state);
        self.eid.hash(state);
    }
}

impl fmt::Display for SdkEidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SDK {} {} EID {:#x} on {}: {}",
            self.sdk_version, self.module, self.eid, self.bdf, self.info
        )
    }
}
