use accel_exporter::{Exporter, ExporterBuilder, ExporterConfig};
use accel_logwatch::TailerConfig;
use accel_telemetry::mock::MockLibrary;
use accel_telemetry::PollerConfig;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const COMMON: &str = "deviceId,uuid,pod,namespace,container,host,driver,bios,name,dieId";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(dir: &Path, catalog: &str) -> ExporterConfig {
    let path = dir.join("default-counters.csv");
    fs::write(&path, catalog).unwrap();

    ExporterConfig::new()
        .with_port(0)
        .with_metric_catalog(path)
        .with_mount_point(dir)
        .with_register_dir(dir.join("register"))
        .with_poller(
            PollerConfig::new()
                .with_interval(Duration::from_millis(20))
                .with_settle_delay(Duration::from_millis(1))
                .with_retry_backoff(Duration::from_millis(1)),
        )
        .with_tailer(TailerConfig::new().with_poll_interval(Duration::from_millis(10)))
}

fn sample_lines<'a>(text: &'a str, family: &str) -> Vec<&'a str> {
    let prefix = format!("{}{{", family);
    text.lines().filter(|line| line.starts_with(&prefix)).collect()
}

/// Scrape until `done` accepts the text or five seconds pass
fn scrape_until(exporter: &Exporter, done: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = exporter.assembler().scrape().unwrap();
        if done(&text) || Instant::now() >= deadline {
            return text;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

async fn http_get(address: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(address).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_devices_export_scaled_temperature() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let catalog = format!(
        "chip_hotspot_temp,Gauge,accel_temperature,Hotspot temperature,{}\n",
        COMMON
    );

    let builder = ExporterBuilder::new()
        .with_config(config(dir.path(), &catalog))
        .with_library(Arc::new(
            MockLibrary::new(2, 1)
                .with_device_counts(vec![2, 2])
                .with_temperature(5000),
        ))
        .with_host_name("node-1");
    let mut exporter = tokio::task::spawn_blocking(move || builder.build())
        .await
        .unwrap()
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        exporter
            .serve_on(listener, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
        exporter
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let lines = loop {
        let response = http_get(address, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let lines: Vec<String> = sample_lines(&response, "accel_temperature")
            .into_iter()
            .map(str::to_string)
            .collect();
        if lines.len() == 2 || Instant::now() >= deadline {
            break lines;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(lines.len(), 2);
    for device in 0..2 {
        assert!(lines.iter().any(|line| {
            line.contains(&format!("deviceId=\"{}\"", device))
                && line.contains("dieId=\"0\"")
                && line.contains("host=\"node-1\"")
                && line.ends_with(" 50")
        }));
    }

    shutdown_tx.send(()).unwrap();
    let exporter = server.await.unwrap();
    assert!(!exporter.is_running());
}

#[test]
fn test_kernel_log_errors_are_exported() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join("var/log");
    fs::create_dir_all(&log_dir).unwrap();
    let kern_log = log_dir.join("kern.log");
    fs::write(&kern_log, "METAX.B100.SMI.ERROR written before startup\n").unwrap();

    let catalog = format!(
        "driver_log_errors,Counter,accel_driver_log_errors,Driver log errors,submodule,level,{}\n",
        COMMON
    );
    let mut exporter = ExporterBuilder::new()
        .with_config(config(dir.path(), &catalog))
        .with_library(Arc::new(MockLibrary::new(1, 1)))
        .build()
        .unwrap();
    assert!(exporter.log_feeds().kernel.is_some());
    assert!(exporter.log_feeds().system.is_none());

    // Device 0 sits at 0000:01:00.0
    let mut file = OpenOptions::new().append(true).open(&kern_log).unwrap();
    file.write_all(b"METAX.B100.D0.SMI.ERROR fence timeout\n").unwrap();

    let text = scrape_until(&exporter, |text| {
        !sample_lines(text, "accel_driver_log_errors").is_empty()
    });
    let lines = sample_lines(&text, "accel_driver_log_errors");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("submodule=\"SMI\""));
    assert!(lines[0].contains("level=\"ERROR\""));
    assert!(lines[0].contains("deviceId=\"0\""));
    assert!(lines[0].ends_with(" 1"));

    exporter.stop().unwrap();
}
