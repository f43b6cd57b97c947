//! # accel-logwatch
//!
//! Tails kernel and system logs for accelerator driver and SDK errors.
//!
//! This crate provides:
//! - Typed log records with identity rules that ignore the free-form text
//! - Regex pattern handlers that accumulate records until drained
//! - A rotation-aware file tailer running on its own thread
//! - Kernel log and system log sources with their default file search lists
//!
//! ## Example
//!
//! ```rust,no_run
//! use accel_logwatch::{KernelLogWatch, TailerConfig};
//! use std::path::Path;
//!
//! let watch = KernelLogWatch::new(TailerConfig::default());
//! let handle = watch.start(Path::new("/"), None).unwrap();
//!
//! for record in watch.drain_kernel_errors() {
//!     println!("{} {} {}", record.bdf, record.submodule, record.level);
//! }
//! # drop(handle);
//! ```

use thiserror::Error;

pub mod handler;
pub mod record;
pub mod sources;
pub mod tailer;

pub use handler::{LogHandler, LogPattern, PatternHandler};
pub use record::{normalize_bdf, DriverEidError, KernelError, SdkEidError};
pub use sources::{KernelLogWatch, LogSource, SysLogWatch};
pub use tailer::{resolve_log_file, LogTailer, TailerConfig, TailerHandle, TailerStatus};

/// Result type for log watching operations
pub type Result<T> = std::result::Result<T, LogWatchError>;

/// Errors that can occur while watching logs
#[derive(Error, Debug)]
pub enum LogWatchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Log file unavailable: {0}")]
    Unavailable(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogWatchError {
    /// Check if retrying later might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogWatchError::Unavailable(_) | LogWatchError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_watch_error_properties() {
        let missing = LogWatchError::Unavailable("/var/log/messages".to_string());
        assert!(missing.is_retryable());
        assert_eq!(missing.to_string(), "Log file unavailable: /var/log/messages");

        let config = LogWatchError::Configuration("zero poll interval".to_string());
        assert!(!config.is_retryable());
    }
}
