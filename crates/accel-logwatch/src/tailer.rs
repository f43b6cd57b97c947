//! Rotation-aware log file tailer
//!
//! The tailer opens its file at the current end, so only lines written after
//! start are observed. When the file shrinks, or another file takes its
//! path, it is treated as rotated and is re-read from the beginning.

use crate::handler::LogHandler;
use crate::{LogWatchError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Tailer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    /// Time between two reads of the file
    pub poll_interval: Duration,

    /// Keep looking for the file when it is missing or becomes unreadable
    pub retry_missing: bool,

    /// Time between two resolution attempts when `retry_missing` is set
    pub retry_interval: Duration,
}

impl TailerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_missing(mut self, retry_interval: Duration) -> Self {
        self.retry_missing = true;
        self.retry_interval = retry_interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("Log poll interval must be greater than zero".to_string());
        }

        if self.retry_missing && self.retry_interval.is_zero() {
            return Err("Log retry interval must be greater than zero".to_string());
        }

        Ok(())
    }
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry_missing: false,
            retry_interval: Duration::from_secs(60),
        }
    }
}

/// Observable state of a tailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailerStatus {
    Starting,
    /// Tailing the given file
    Running(PathBuf),
    /// No readable file; the source's metrics cannot be exported
    Unavailable,
}

/// Find the log file to tail under `mount_point`
///
/// An explicit file is taken relative to the mount point and only needs to
/// exist. Otherwise the first candidate that exists and is non-empty wins.
pub fn resolve_log_file(
    mount_point: &Path,
    explicit: Option<&Path>,
    candidates: &[&str],
) -> Option<PathBuf> {
    if let Some(explicit) = explicit {
        let relative = explicit.strip_prefix("/").unwrap_or(explicit);
        let path = mount_point.join(relative);
        return path.is_file().then_some(path);
    }

    candidates
        .iter()
        .map(|candidate| mount_point.join(candidate))
        .find(|path| {
            fs::metadata(path)
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false)
        })
}

/// Longest unterminated line kept between polls
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Open file plus the read position and any unterminated trailing bytes
struct Tail {
    path: PathBuf,
    file: File,
    offset: u64,
    pending: Vec<u8>,
}

impl Tail {
    fn open_at_end(path: PathBuf) -> std::io::Result<Self> {
        let mut file = File::open(&path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            file,
            offset,
            pending: Vec::new(),
        })
    }

    /// Read everything appended since the last poll and dispatch complete lines
    ///
    /// A file replaced under the same path is drained through the old handle
    /// first, then the new file is read from the start.
    fn poll(&mut self, handlers: &[Arc<dyn LogHandler>]) -> std::io::Result<usize> {
        let on_disk = fs::metadata(&self.path)?;
        let mut parsed = 0;

        if !same_file(&on_disk, &self.file.metadata()?) {
            parsed += self.read_appended(handlers)?;
            info!(path = %self.path.display(), "Log file was replaced, reading the new file");
            self.reopen()?;
        } else if on_disk.len() < self.offset {
            info!(
                path = %self.path.display(),
                "Log file shrank from {} to {} bytes, reading from the start",
                self.offset,
                on_disk.len()
            );
            self.reopen()?;
        }

        parsed += self.read_appended(handlers)?;
        if parsed > 0 {
            debug!(path = %self.path.display(), parsed, "Dispatched new log lines");
        }
        Ok(parsed)
    }

    fn reopen(&mut self) -> std::io::Result<()> {
        self.file = File::open(&self.path)?;
        self.offset = 0;
        self.pending.clear();
        Ok(())
    }

    /// Decode only whole lines so a character split across reads stays intact
    fn read_appended(&mut self, handlers: &[Arc<dyn LogHandler>]) -> std::io::Result<usize> {
        let read = self.file.read_to_end(&mut self.pending)?;
        self.offset += read as u64;

        let parsed: usize = match self.pending.iter().rposition(|byte| *byte == b'\n') {
            Some(end) => {
                let rest = self.pending.split_off(end + 1);
                let complete = std::mem::replace(&mut self.pending, rest);
                let text = String::from_utf8_lossy(&complete);
                handlers.iter().map(|handler| handler.handle(&text)).sum()
            }
            None => 0,
        };

        if self.pending.len() > MAX_PENDING_BYTES {
            warn!(
                path = %self.path.display(),
                "Dropping {} bytes without a line break",
                self.pending.len()
            );
            self.pending.clear();
        }
        Ok(parsed)
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    true
}

/// Tails one log source and feeds its handlers
pub struct LogTailer {
    name: &'static str,
    candidates: &'static [&'static str],
    handlers: Vec<Arc<dyn LogHandler>>,
    config: TailerConfig,
}

impl LogTailer {
    pub fn new(
        name: &'static str,
        candidates: &'static [&'static str],
        config: TailerConfig,
    ) -> Self {
        Self {
            name,
            candidates,
            handlers: Vec::new(),
            config,
        }
    }

    /// Register a handler that receives every new line
    pub fn with_handler(mut self, handler: Arc<dyn LogHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Resolve and open the file, then tail it on a dedicated thread
    ///
    /// A missing file is not an error: the returned handle reports
    /// [`TailerStatus::Unavailable`]. With `retry_missing` set the thread is
    /// started anyway and keeps looking for the file.
    pub fn start(self, mount_point: &Path, explicit: Option<&Path>) -> Result<TailerHandle> {
        self.config
            .validate()
            .map_err(LogWatchError::Configuration)?;

        let worker = Worker {
            name: self.name,
            candidates: self.candidates,
            mount_point: mount_point.to_path_buf(),
            explicit: explicit.map(Path::to_path_buf),
            handlers: self.handlers,
            config: self.config,
            status: Arc::new(Mutex::new(TailerStatus::Starting)),
            stop: Arc::new(AtomicBool::new(false)),
        };

        let initial = worker.open();
        let mut handle = TailerHandle {
            status: worker.status.clone(),
            stop: worker.stop.clone(),
            join: None,
        };

        if initial.is_none() && !worker.config.retry_missing {
            return Ok(handle);
        }

        if let Some(tail) = &initial {
            *worker.status.lock() = TailerStatus::Running(tail.path.clone());
        }

        let join = thread::Builder::new()
            .name(format!("accel-logwatch-{}", worker.name))
            .spawn(move || worker.run(initial))?;
        handle.join = Some(join);

        Ok(handle)
    }
}

impl std::fmt::Debug for LogTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailer")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .field("handlers", &self.handlers.len())
            .field("config", &self.config)
            .finish()
    }
}

struct Worker {
    name: &'static str,
    candidates: &'static [&'static str],
    mount_point: PathBuf,
    explicit: Option<PathBuf>,
    handlers: Vec<Arc<dyn LogHandler>>,
    config: TailerConfig,
    status: Arc<Mutex<TailerStatus>>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn open(&self) -> Option<Tail> {
        let path = match resolve_log_file(
            &self.mount_point,
            self.explicit.as_deref(),
            self.candidates,
        ) {
            Some(path) => path,
            None => {
                warn!(
                    source = self.name,
                    mount_point = %self.mount_point.display(),
                    "No readable log file found, {} log metrics are unavailable",
                    self.name
                );
                *self.status.lock() = TailerStatus::Unavailable;
                return None;
            }
        };

        match Tail::open_at_end(path) {
            Ok(tail) => {
                info!(source = self.name, path = %tail.path.display(), "Tailing log file");
                Some(tail)
            }
            Err(e) => {
                warn!(source = self.name, "Failed to open log file: {}", e);
                *self.status.lock() = TailerStatus::Unavailable;
                None
            }
        }
    }

    fn run(self, initial: Option<Tail>) {
        let mut next = initial;

        while !self.stop.load(Ordering::SeqCst) {
            let mut tail = match next.take().or_else(|| self.open()) {
                Some(tail) => tail,
                None => {
                    if self.config.retry_missing && self.pause(self.config.retry_interval) {
                        continue;
                    }
                    break;
                }
            };
            *self.status.lock() = TailerStatus::Running(tail.path.clone());

            loop {
                if let Err(e) = tail.poll(&self.handlers) {
                    error!(source = self.name, path = %tail.path.display(), "Log read failed: {}", e);
                    *self.status.lock() = TailerStatus::Unavailable;
                    break;
                }
                if !self.pause(self.config.poll_interval) {
                    return;
                }
            }

            if !self.config.retry_missing {
                break;
            }
        }

        debug!(source = self.name, "Log tailer stopped");
    }

    /// Sleep in slices; false once a stop was requested
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Handle to a started tailer
pub struct TailerHandle {
    status: Arc<Mutex<TailerStatus>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TailerHandle {
    pub fn status(&self) -> TailerStatus {
        self.status.lock().clone()
    }

    /// Whether the source's file is currently being tailed
    pub fn is_available(&self) -> bool {
        matches!(*self.status.lock(), TailerStatus::Running(_))
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| {
                error!("Log tailer thread panicked");
                LogWatchError::Thread("log tailer thread panicked".to_string())
            })?;
        }
        Ok(())
    }
}

impl Drop for TailerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TailerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailerHandle")
            .field("status", &self.status())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PatternHandler;
    use crate::record::KernelError;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    const CANDIDATES: &[&str] = &["var/log/messages", "var/log/kern.log"];

    fn log_dir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("var/log");
        fs::create_dir_all(&log).unwrap();
        (dir, log)
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
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
    fn test_tailer_config_validation() {
        assert!(TailerConfig::default().validate().is_ok());
        assert_eq!(TailerConfig::default().poll_interval, Duration::from_secs(5));

        let config = TailerConfig::new().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = TailerConfig::new().with_retry_missing(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_skips_empty_candidates() {
        let (dir, log) = log_dir();
        fs::write(log.join("messages"), "").unwrap();
        fs::write(log.join("kern.log"), "boot\n").unwrap();

        let resolved = resolve_log_file(dir.path(), None, CANDIDATES).unwrap();
        assert_eq!(resolved, log.join("kern.log"));

        fs::write(log.join("messages"), "boot\n").unwrap();
        let resolved = resolve_log_file(dir.path(), None, CANDIDATES).unwrap();
        assert_eq!(resolved, log.join("messages"));
    }

    #[test]
    fn test_resolve_explicit_file() {
        let (dir, log) = log_dir();
        fs::write(log.join("custom.log"), "").unwrap();

        let resolved =
            resolve_log_file(dir.path(), Some(Path::new("/var/log/custom.log")), CANDIDATES);
        assert_eq!(resolved, Some(log.join("custom.log")));

        let missing = resolve_log_file(dir.path(), Some(Path::new("var/log/none")), CANDIDATES);
        assert!(missing.is_none());
        assert!(resolve_log_file(dir.path(), None, CANDIDATES).is_none());
    }

    #[test]
    fn test_tail_reads_only_new_lines() {
        let (_dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "METAX.B4F00.SMI.ERROR before start\n");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let handlers: Vec<Arc<dyn LogHandler>> = vec![handler.clone()];
        let mut tail = Tail::open_at_end(path.clone()).unwrap();

        assert_eq!(tail.poll(&handlers).unwrap(), 0);

        append(&path, "METAX.B4F00.SMI.ERROR after start\nMETAX.B4F00.SMI.ERR");
        assert_eq!(tail.poll(&handlers).unwrap(), 1);

        append(&path, "OR completed later\n");
        assert_eq!(tail.poll(&handlers).unwrap(), 1);

        let records = handler.drain();
        assert_eq!(records[0].content, "after start");
        assert_eq!(records[1].content, "completed later");
    }

    #[test]
    fn test_tail_rereads_after_truncation() {
        let (_dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let handlers: Vec<Arc<dyn LogHandler>> = vec![handler.clone()];
        let mut tail = Tail::open_at_end(path.clone()).unwrap();

        append(
            &path,
            "METAX.B4F00.SMI.ERROR one\nMETAX.B4F00.SMI.ERROR two\nMETAX.B4F00.SMI.ERROR three\n",
        );
        assert_eq!(tail.poll(&handlers).unwrap(), 3);
        handler.drain();

        fs::write(&path, "MXCD.B100.CORE.ALERT rotated\n").unwrap();
        assert_eq!(tail.poll(&handlers).unwrap(), 1);

        let records = handler.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].module, "MXCD");
        assert_eq!(records[0].content, "rotated");
    }

    #[test]
    fn test_character_split_across_reads_is_kept() {
        let (_dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let handlers: Vec<Arc<dyn LogHandler>> = vec![handler.clone()];
        let mut tail = Tail::open_at_end(path.clone()).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"METAX.B4F00.SMI.ERROR temp\xC3").unwrap();
        assert_eq!(tail.poll(&handlers).unwrap(), 0);

        file.write_all(b"\xA9rature\n").unwrap();
        assert_eq!(tail.poll(&handlers).unwrap(), 1);
        assert_eq!(handler.drain()[0].content, "temp\u{e9}rature");
    }

    #[test]
    fn test_tail_follows_replaced_file() {
        let (_dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "boot\n");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let handlers: Vec<Arc<dyn LogHandler>> = vec![handler.clone()];
        let mut tail = Tail::open_at_end(path.clone()).unwrap();

        append(&path, "METAX.B4F00.SMI.ERROR before rename\n");
        fs::rename(&path, log.join("messages.1")).unwrap();
        append(
            &path,
            "METAX.B4F00.SMI.ERROR new file, already longer than the old read offset\n",
        );

        assert_eq!(tail.poll(&handlers).unwrap(), 2);
        let records = handler.drain();
        assert_eq!(records[0].content, "before rename");
        assert!(records[1].content.starts_with("new file"));

        append(&path, "METAX.B4F00.SMI.ERROR after rename\n");
        assert_eq!(tail.poll(&handlers).unwrap(), 1);
        assert_eq!(handler.drain()[0].content, "after rename");
    }

    #[test]
    fn test_unterminated_garbage_is_dropped() {
        let (_dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let handlers: Vec<Arc<dyn LogHandler>> = vec![handler.clone()];
        let mut tail = Tail::open_at_end(path.clone()).unwrap();

        append(&path, &"x".repeat(MAX_PENDING_BYTES + 1));
        assert_eq!(tail.poll(&handlers).unwrap(), 0);
        assert!(tail.pending.is_empty());

        append(&path, "METAX.B4F00.SMI.ERROR recovered\n");
        assert_eq!(tail.poll(&handlers).unwrap(), 1);
        assert_eq!(handler.drain()[0].content, "recovered");
    }

    #[test]
    fn test_missing_file_reports_unavailable() {
        let (dir, _log) = log_dir();
        let handle = LogTailer::new("kernel", CANDIDATES, TailerConfig::default())
            .start(dir.path(), None)
            .unwrap();

        assert_eq!(handle.status(), TailerStatus::Unavailable);
        assert!(!handle.is_available());
        assert!(!handle.is_running());
    }

    #[test]
    fn test_tailer_thread_observes_appends() {
        let (dir, log) = log_dir();
        let path = log.join("messages");
        append(&path, "boot\n");

        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let config = TailerConfig::new().with_poll_interval(Duration::from_millis(10));
        let mut handle = LogTailer::new("kernel", CANDIDATES, config)
            .with_handler(handler.clone())
            .start(dir.path(), None)
            .unwrap();

        assert_eq!(handle.status(), TailerStatus::Running(path.clone()));
        append(&path, "METAX.B4F00.D1.SMI.ERROR fence timeout\n");

        assert!(wait_for(|| handler.len() == 1));
        handle.stop().unwrap();
        assert!(!handle.is_running());
        assert_eq!(handler.drain()[0].die_id, 1);
    }

    #[test]
    fn test_retry_finds_late_file() {
        let (dir, log) = log_dir();
        let handler = Arc::new(PatternHandler::<KernelError>::new());
        let config = TailerConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_missing(Duration::from_millis(10));
        let mut handle = LogTailer::new("kernel", CANDIDATES, config)
            .with_handler(handler.clone())
            .start(dir.path(), None)
            .unwrap();

        assert!(handle.is_running());
        assert_eq!(handle.status(), TailerStatus::Unavailable);

        let path = log.join("kern.log");
        append(&path, "boot\n");
        assert!(wait_for(|| handle.is_available()));

        append(&path, "MXGVM.B10108.MMU.ERROR late\n");
        assert!(wait_for(|| handler.len() == 1));
        handle.stop().unwrap();
    }
}
