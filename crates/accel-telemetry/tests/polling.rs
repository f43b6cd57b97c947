use accel_telemetry::mock::MockLibrary;
use accel_telemetry::source::{QueryStatus, VirtualizationMode};
use accel_telemetry::{
    DeviceRole, EntityKey, MetricRegistry, MetricValue, Poller, PollerConfig, PollerState,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ready_poller(library: Arc<MockLibrary>) -> Poller {
    let config = PollerConfig::new()
        .with_interval(Duration::from_millis(50))
        .with_settle_delay(Duration::from_millis(1))
        .with_retry_backoff(Duration::from_millis(1));
    let mut poller = Poller::new(library, config).unwrap();
    let supported = poller.initialize();
    poller.set_required(supported);
    poller
}

#[test]
fn test_two_devices_report_scaled_temperature() {
    init_tracing();
    let library = Arc::new(
        MockLibrary::new(2, 1)
            .with_device_counts(vec![2, 2])
            .with_temperature(5000),
    );
    let mut poller = ready_poller(library);

    let report = poller.run_cycle();
    assert!(report.collected);
    assert!(!report.needs_rebuild);

    let snapshot = poller.store().snapshot();
    for device in 0..2 {
        assert_eq!(
            snapshot[&EntityKey::Die(device, 0)]["chip_hotspot_temp"],
            MetricValue::Scalar(50.0)
        );
    }
}

#[test]
fn test_unsupported_metric_returns_after_rebuild() {
    init_tracing();
    let library = Arc::new(MockLibrary::new(1, 1));
    library.fail("die_throttle_reason", QueryStatus::NotSupported);
    let mut poller = ready_poller(library.clone());
    library.reset_calls();

    poller.run_cycle();
    assert_eq!(library.calls("die_throttle_reason"), 1);
    assert!(!poller.context().is_required("clk_thr"));

    poller.run_cycle();
    assert_eq!(library.calls("die_throttle_reason"), 1);

    poller.request_rebuild();
    let report = poller.run_cycle();
    assert!(report.collected);
    assert_eq!(poller.state(), PollerState::Steady);
    assert_eq!(library.calls("die_throttle_reason"), 2);
}

#[test]
fn test_roles_only_receive_applicable_metrics() {
    init_tracing();
    let library = Arc::new(
        MockLibrary::new(3, 2)
            .with_pf_count(1)
            .with_mode(2, VirtualizationMode::Vf),
    );
    let mut poller = ready_poller(library);
    poller.run_cycle();

    let registry = MetricRegistry::new();
    let topology = poller.store().topology();
    let snapshot = poller.store().snapshot();
    assert!(!snapshot.is_empty());

    for (key, values) in &snapshot {
        let role = topology.device(key.device_id()).unwrap().role;
        for id in values.keys() {
            let definition = registry.get(id).unwrap();
            assert!(
                definition.applicability.applies_to_role(role),
                "{} collected for {} ({})",
                id,
                key,
                role
            );
        }
    }

    let vf_values = &snapshot[&EntityKey::Die(2, 0)];
    assert!(vf_values.contains_key("memory_usage"));
    assert!(!vf_values.contains_key("chip_hotspot_temp"));
    assert!(topology
        .devices_with_role(DeviceRole::PhysicalFunction)
        .all(|device| !snapshot
            .get(&EntityKey::Die(device.id, 0))
            .map(|values| values.contains_key("memory_usage"))
            .unwrap_or(false)));
}

#[test]
fn test_disagreeing_reads_keep_discovering() {
    init_tracing();
    let library = Arc::new(MockLibrary::new(2, 1).with_device_counts(vec![2, 1]));
    let config = PollerConfig::new().with_settle_delay(Duration::from_millis(1));
    let mut poller = Poller::new(library, config).unwrap();

    assert!(!poller.try_discover());
    assert_eq!(poller.state(), PollerState::Discovering);
    assert!(poller.store().topology().is_empty());
}

#[test]
fn test_rebuild_starts_a_new_generation() {
    init_tracing();
    let library = Arc::new(MockLibrary::new(2, 1));
    let mut poller = ready_poller(library.clone());
    poller.run_cycle();
    let generation = poller.store().generation();

    library.fail_once("pcie_info", QueryStatus::NoDevice);
    let report = poller.run_cycle();
    assert!(report.needs_rebuild);
    assert_eq!(poller.store().generation(), generation);

    library.set_device_count(1);
    poller.run_cycle();
    assert_eq!(poller.store().generation(), generation + 1);

    let snapshot = poller.store().snapshot();
    assert!(snapshot.keys().all(|key| key.device_id() == 0));
}
