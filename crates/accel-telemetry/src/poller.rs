//! Polling state machine
//!
//! `Uninitialized -> Discovering -> Steady -> Discovering -> ...`
//!
//! Discovery only completes once two device-count reads separated by the
//! settle delay agree. A steady poller runs one collection cycle per interval
//! and falls back to discovery whenever a cycle reports a systemic failure.

use crate::collect::CollectContext;
use crate::config::PollerConfig;
use crate::registry::MetricRegistry;
use crate::source::{DeviceLibrary, Query, TelemetrySource};
use crate::store::MetricStore;
use crate::topology::{discover, Topology};
use crate::{Result, TelemetryError};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted sleep, bounds how long a stop request waits
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Observable poller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerState {
    Uninitialized,
    Discovering,
    Steady,
}

impl Default for PollerState {
    fn default() -> Self {
        PollerState::Uninitialized
    }
}

/// Poller statistics shared with readers
#[derive(Debug, Default)]
pub struct PollerStats {
    state: Mutex<PollerState>,
    cycles: AtomicU64,
    overruns: AtomicU64,
    discoveries: AtomicU64,
    last_cycle_micros: AtomicU64,
}

impl PollerStats {
    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }

    fn set_state(&self, state: PollerState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Poller state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn discoveries(&self) -> u64 {
        self.discoveries.load(Ordering::Relaxed)
    }

    /// Wall time of the most recent collection cycle
    pub fn last_cycle(&self) -> Duration {
        Duration::from_micros(self.last_cycle_micros.load(Ordering::Relaxed))
    }
}

/// Timing and health of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub elapsed: Duration,
    /// The cycle took at least one full interval
    pub overran: bool,
    /// Metrics were collected; false while discovery keeps failing
    pub collected: bool,
    /// The next cycle starts with a rebuild
    pub needs_rebuild: bool,
}

/// Drives discovery and collection for one device library
pub struct Poller {
    config: PollerConfig,
    ctx: CollectContext,
    registry: MetricRegistry,
    configured: Vec<&'static str>,
    supported: Vec<&'static str>,
    stats: Arc<PollerStats>,
    stop: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(library: Arc<dyn DeviceLibrary>, config: PollerConfig) -> Result<Self> {
        config.validate().map_err(TelemetryError::Configuration)?;

        let source = TelemetrySource::new(library, config.init_flags);
        let store = Arc::new(MetricStore::new());
        let ctx = CollectContext::new(source, store, config.limits.clone());

        Ok(Self {
            config,
            ctx,
            registry: MetricRegistry::new(),
            configured: Vec::new(),
            supported: Vec::new(),
            stats: Arc::new(PollerStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<MetricStore> {
        self.ctx.store().clone()
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> PollerState {
        self.stats.state()
    }

    pub fn context(&self) -> &CollectContext {
        &self.ctx
    }

    /// Metric ids meaningful for the discovered product family
    pub fn supported(&self) -> &[&'static str] {
        &self.supported
    }

    /// Block until discovery succeeds and return the supported metric ids.
    ///
    /// Returns an empty list if the poller is stopped first.
    pub fn initialize(&mut self) -> Vec<&'static str> {
        loop {
            if self.try_discover() {
                return self.supported.clone();
            }
            if !self.pause(self.config.retry_backoff) {
                return Vec::new();
            }
        }
    }

    /// Operator-configured metric set, restored on every rebuild
    pub fn set_required<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut configured = Vec::new();
        for id in ids {
            let id = id.as_ref();
            match self.registry.get(id) {
                Some(definition) if self.supported.contains(&definition.id) => {
                    configured.push(definition.id);
                }
                Some(_) => warn!("Metric {} is not supported by this product family", id),
                None => warn!("Unknown metric {}", id),
            }
        }
        info!("Collecting {} configured metrics", configured.len());
        self.ctx.set_required(configured.iter().copied());
        self.configured = configured;
    }

    pub fn request_rebuild(&mut self) {
        self.ctx.request_rebuild();
    }

    /// One double-read consistency check followed by discovery.
    ///
    /// On success a new generation begins: fresh topology, empty store and
    /// the full configured metric set.
    pub fn try_discover(&mut self) -> bool {
        self.stats.set_state(PollerState::Discovering);

        let first = match self.read_device_count() {
            Ok(count) => count,
            Err(status) => {
                warn!("First device library initialization failed: {}", status);
                return false;
            }
        };
        debug!("Device count, first read: {}", first);

        if !self.pause(self.config.settle_delay) {
            return false;
        }

        let second = match self.read_device_count() {
            Ok(count) => count,
            Err(status) => {
                warn!("Second device library initialization failed: {}", status);
                return false;
            }
        };
        debug!("Device count, second read: {}", second);

        if first != second {
            warn!("{}", TelemetryError::InconsistentCount { first, second });
            return false;
        }

        let (topology, retry) = match discover(self.ctx.source(), &self.config.limits) {
            Ok(topology) => (topology, false),
            Err(err) => {
                warn!("Topology discovery failed: {}", err);
                (Topology::new(), err.needs_rediscovery())
            }
        };

        self.supported = self.registry.supported_for(topology.family());
        let required: Vec<&'static str> = self
            .configured
            .iter()
            .copied()
            .filter(|id| self.supported.contains(id))
            .collect();

        let topology = Arc::new(topology);
        let generation = self.ctx.store().reset_generation(topology.clone());
        self.ctx.begin_generation(topology, required);
        if retry {
            self.ctx.request_rebuild();
        }

        self.stats.discoveries.fetch_add(1, Ordering::Relaxed);
        self.stats.set_state(PollerState::Steady);
        info!(
            "Generation {} ready: {} devices, {} supported metrics",
            generation,
            self.ctx.topology().devices().len(),
            self.supported.len()
        );
        true
    }

    fn read_device_count(&self) -> Query<u32> {
        self.ctx.source().init()?;
        Ok(self.ctx.source().device_count())
    }

    /// Rebuild if flagged, then collect once
    pub fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();

        let ready = if self.state() != PollerState::Steady || self.ctx.needs_rebuild() {
            info!("Rebuilding device topology");
            self.try_discover()
        } else {
            true
        };

        if ready {
            self.ctx.run_cycle();
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        }

        let elapsed = started.elapsed();
        self.stats
            .last_cycle_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);

        CycleReport {
            elapsed,
            overran: elapsed >= self.config.interval,
            collected: ready,
            needs_rebuild: !ready || self.ctx.needs_rebuild(),
        }
    }

    /// Move the poller onto its own named thread
    pub fn start(self) -> Result<PollerHandle> {
        let store = self.store();
        let stats = self.stats();
        let stop = self.stop.clone();

        let join = thread::Builder::new()
            .name("accel-poller".to_string())
            .spawn(move || self.run())?;

        Ok(PollerHandle {
            store,
            stats,
            stop,
            join: Some(join),
        })
    }

    fn run(mut self) {
        info!(
            "Poller started with a {:?} collection interval",
            self.config.interval
        );

        while !self.stop.load(Ordering::SeqCst) {
            let report = self.run_cycle();

            let wait = if !report.collected {
                self.config.retry_backoff
            } else if let Some(remaining) = self.config.interval.checked_sub(report.elapsed) {
                remaining
            } else {
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Collection cycle took {:?}, longer than the {:?} interval",
                    report.elapsed, self.config.interval
                );
                Duration::ZERO
            };

            if !self.pause(wait) {
                break;
            }
        }

        info!("Poller stopped");
    }

    /// Sleep in slices; false once a stop has been requested
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

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("state", &self.stats.state())
            .field("configured", &self.configured.len())
            .finish()
    }
}

/// Handle to a running poller thread
#[derive(Debug)]
pub struct PollerHandle {
    store: Arc<MetricStore>,
    stats: Arc<PollerStats>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn store(&self) -> Arc<MetricStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Request a stop and wait for the current cycle to finish
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| {
                error!("Poller thread panicked");
                TelemetryError::Thread("poller thread panicked".to_string())
            })?;
        }
        Ok(())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{EntityKey, MetricValue};
    use crate::mock::MockLibrary;
    use crate::source::QueryStatus;

    fn fast_config() -> PollerConfig {
        PollerConfig::new()
            .with_interval(Duration::from_millis(20))
            .with_settle_delay(Duration::from_millis(1))
            .with_retry_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_poller_rejects_invalid_config() {
        let library = Arc::new(MockLibrary::new(1, 1));
        let config = fast_config().with_interval(Duration::ZERO);
        let err = Poller::new(library, config).unwrap_err();
        assert!(err.is_configuration_issue());
    }

    #[test]
    fn test_discovery_reaches_steady() {
        let library = Arc::new(MockLibrary::new(2, 1));
        let mut poller = Poller::new(library.clone(), fast_config()).unwrap();
        assert_eq!(poller.state(), PollerState::Uninitialized);

        let supported = poller.initialize();
        assert!(supported.contains(&"gpu_usage"));
        assert_eq!(poller.state(), PollerState::Steady);
        assert_eq!(poller.store().generation(), 1);
        assert_eq!(library.calls("init_with_flags"), 2);
    }

    #[test]
    fn test_inconsistent_counts_stay_discovering() {
        let library = Arc::new(MockLibrary::new(2, 1).with_device_counts(vec![2, 3]));
        let mut poller = Poller::new(library, fast_config()).unwrap();

        assert!(!poller.try_discover());
        assert_eq!(poller.state(), PollerState::Discovering);
        assert_eq!(poller.store().generation(), 0);

        // The scripted reads settle on 3
        assert!(poller.try_discover());
        assert_eq!(poller.state(), PollerState::Steady);
    }

    #[test]
    fn test_init_failure_stays_discovering() {
        let library = Arc::new(MockLibrary::new(1, 1));
        library.fail_once("init_with_flags", QueryStatus::LoadLibraryFailure);
        let mut poller = Poller::new(library, fast_config()).unwrap();

        let report = poller.run_cycle();
        assert!(!report.collected);
        assert!(report.needs_rebuild);
        assert_eq!(poller.state(), PollerState::Discovering);
    }

    #[test]
    fn test_ceiling_exceeded_forces_rediscovery() {
        let library = Arc::new(MockLibrary::new(65, 1));
        let mut poller = Poller::new(library.clone(), fast_config()).unwrap();

        assert!(poller.try_discover());
        assert!(poller.context().topology().is_empty());
        assert!(poller.context().needs_rebuild());

        library.set_device_count(2);
        let report = poller.run_cycle();
        assert!(report.collected);
        assert_eq!(poller.context().topology().devices().len(), 2);
        assert_eq!(poller.store().generation(), 2);
    }

    #[test]
    fn test_set_required_filters_unsupported() {
        let library = Arc::new(MockLibrary::new(1, 1));
        let mut poller = Poller::new(library, fast_config()).unwrap();
        poller.initialize();

        poller.set_required(["gpu_usage", "dla_usage", "fan_speed", "sgpu_usage"]);
        let ctx = poller.context();
        assert!(ctx.is_required("gpu_usage"));
        assert!(ctx.is_required("sgpu_usage"));
        assert!(!ctx.is_required("dla_usage"));
        assert!(!ctx.is_required("fan_speed"));
    }

    #[test]
    fn test_systemic_failure_triggers_rebuild() {
        let library = Arc::new(MockLibrary::new(1, 1));
        let mut poller = Poller::new(library.clone(), fast_config()).unwrap();
        poller.initialize();
        poller.set_required(["memory_used", "chip_hotspot_temp"]);

        library.fail_once("die_memory_info", QueryStatus::Failure);
        let report = poller.run_cycle();
        assert!(report.needs_rebuild);

        let report = poller.run_cycle();
        assert!(report.collected);
        assert!(!report.needs_rebuild);
        assert_eq!(poller.store().generation(), 2);
        assert_eq!(
            poller.store().get(EntityKey::Die(0, 0), "chip_hotspot_temp"),
            Some(MetricValue::Scalar(50.0))
        );
    }

    #[test]
    fn test_poller_thread_start_and_stop() {
        let library = Arc::new(MockLibrary::new(1, 1));
        let mut poller = Poller::new(library, fast_config()).unwrap();
        poller.initialize();
        poller.set_required(["chip_hotspot_temp"]);

        let mut handle = poller.start().unwrap();
        let store = handle.store();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().cycles() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(handle.stats().cycles() >= 2);
        assert!(store.get(EntityKey::Die(0, 0), "chip_hotspot_temp").is_some());
        handle.stop().unwrap();
        assert!(!handle.is_running());
    }
}
