//! End-to-end tests for the ingestion pipeline
//!
//! These tests run CSV files through the driver and the buffered publisher into
//! the in-process log, covering:
//! - Full delivery of a clean file
//! - Normalization of empty and malformed cells
//! - Drain timeouts and unresolved messages
//! - Backpressure from the local queue
//! - Per-key ordering under injected faults
//! - Accounting identities

use busfeed_ingest::driver::{DriverConfig, IngestionDriver, Verdict};
use busfeed_ingest::publisher::{
    BufferedPublisher, Fault, MemoryLog, PublisherConfig, TransportErrorKind,
};
use busfeed_ingest::SourceError;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const TOPIC: &str = "bus-gps-tracking";
const HEADER: &str = "datetime,vehicle,lng,lat,speed,driver,door_up,door_down";

/// Helper to write a CSV file with the standard header
fn csv_file(rows: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", HEADER).unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    file.flush().unwrap();
    file
}

/// Helper to generate `n` well-formed rows spread over `vehicles` vehicles
fn gps_rows(n: usize, vehicles: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            format!(
                "2024-03-01 07:{:02}:{:02},51B-{:03},106.{},10.{},{}.5,{},{},False",
                i / 60,
                i % 60,
                i % vehicles,
                700 + i,
                800 + i,
                i % 40,
                1000 + i,
                if i % 2 == 0 { "True" } else { "false" }
            )
        })
        .collect()
}

fn driver_config() -> DriverConfig {
    DriverConfig {
        topic: TOPIC.to_string(),
        ..Default::default()
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hundred_clean_rows_all_acknowledged() {
    let file = csv_file(&gps_rows(100, 7));
    let log = Arc::new(MemoryLog::new(3));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.total, 100);
    assert_eq!(report.sent, 100);
    assert_eq!(report.failed, 0);
    assert_eq!(report.acknowledged, 100);
    assert_eq!(report.success_rate, 100.0);
    assert_eq!(report.verdict(), Verdict::Healthy);
    assert_eq!(log.message_count(TOPIC), 100);
}

#[tokio::test(start_paused = true)]
async fn test_empty_cells_publish_as_null() {
    let file = csv_file(&["2024-03-01 07:15:02,51B-001,10.5,,,,TRUE,".to_string()]);
    let log = Arc::new(MemoryLog::new(1));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();
    assert_eq!(report.acknowledged, 1);

    let stored = log.records(TOPIC);
    assert_eq!(stored[0].key, "51B-001");
    let payload: serde_json::Value = serde_json::from_slice(&stored[0].payload).unwrap();
    assert_eq!(payload["lng"], 10.5);
    assert!(payload["lat"].is_null());
    assert!(payload["driver"].is_null());
    assert_eq!(payload["door_up"], true);
    assert_eq!(payload["door_down"], false);
}

#[tokio::test(start_paused = true)]
async fn test_bad_rows_counted_and_skipped() {
    let mut rows = gps_rows(8, 2);
    rows.push("2024-03-01 08:00:00,51B-009,east,10.1,0,0,false,false".to_string());
    rows.push("2024-03-01 08:00:01".to_string());

    let file = csv_file(&rows);
    let log = Arc::new(MemoryLog::new(2));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.accounting.normalization_failed, 2);
    assert_eq!(report.acknowledged, 8);
    assert_eq!(report.failed, 2);
    assert_eq!(report.success_rate, 80.0);
    assert_eq!(report.verdict(), Verdict::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_max_records_limits_run() {
    let file = csv_file(&gps_rows(50, 3));
    let log = Arc::new(MemoryLog::new(3));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), Arc::clone(&log)).unwrap();
    let config = DriverConfig {
        max_records: Some(20),
        ..driver_config()
    };
    let mut driver = IngestionDriver::new(publisher, config);

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.total, 20);
    assert_eq!(log.message_count(TOPIC), 20);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_missing_file_is_fatal() {
    let log = Arc::new(MemoryLog::new(1));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), log).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let err = driver
        .ingest_file("/nonexistent/busfeed/gps.csv")
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::NotFound(_)));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_leaves_unresolved() {
    let file = csv_file(&gps_rows(3, 1));
    let log = Arc::new(MemoryLog::new(1).with_latency(Duration::from_secs(120)));
    let publisher = BufferedPublisher::new(PublisherConfig::default(), log).unwrap();
    let config = DriverConfig {
        drain_timeout: Duration::from_secs(2),
        ..driver_config()
    };
    let mut driver = IngestionDriver::new(publisher, config);

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(report.unresolved, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.acknowledged, 0);
    assert_eq!(report.success_rate, 0.0);
    assert_eq!(report.verdict(), Verdict::Failing);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_log_fails_deliveries() {
    let file = csv_file(&gps_rows(10, 2));
    let log = Arc::new(MemoryLog::new(2));
    log.set_unavailable(true);
    let publisher = BufferedPublisher::new(PublisherConfig::default(), Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.sent, 10);
    assert_eq!(report.accounting.delivery_failed, 10);
    assert_eq!(report.failures_by_kind.get("retries_exhausted"), Some(&10));
    assert_eq!(report.acknowledged, 0);
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_without_retries() {
    let file = csv_file(&gps_rows(20, 4));
    let log = Arc::new(MemoryLog::new(2).with_latency(Duration::from_millis(500)));
    let config = PublisherConfig {
        queue_max_messages: 5,
        ..Default::default()
    };
    let publisher = BufferedPublisher::new(config, Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.sent, 5);
    assert_eq!(report.accounting.enqueue_rejected, 15);
    assert_eq!(report.acknowledged, 5);
    assert_eq!(report.failed, 15);
    assert_eq!(log.message_count(TOPIC), 5);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_recovers_with_retries() {
    let file = csv_file(&gps_rows(20, 4));
    let log = Arc::new(MemoryLog::new(2));
    let config = PublisherConfig {
        queue_max_messages: 5,
        linger: Duration::ZERO,
        ..Default::default()
    };
    let publisher = BufferedPublisher::new(config, Arc::clone(&log)).unwrap();
    let driver_config = DriverConfig {
        enqueue_retries: 50,
        ..driver_config()
    };
    let mut driver = IngestionDriver::new(publisher, driver_config);

    let report = driver.ingest_file(file.path()).await.unwrap();

    assert_eq!(report.sent, 20);
    assert_eq!(report.accounting.enqueue_rejected, 0);
    assert_eq!(report.acknowledged, 20);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_per_key_order_survives_faults() {
    let rows = gps_rows(60, 3);
    let file = csv_file(&rows);
    let log = Arc::new(MemoryLog::new(2));
    log.inject(Fault::Fail(TransportErrorKind::NotLeader));
    log.inject(Fault::LoseAck);
    log.inject(Fault::Fail(TransportErrorKind::Network));
    log.inject(Fault::LoseAck);

    let config = PublisherConfig {
        batch_size_bytes: 256,
        ..Default::default()
    };
    let publisher = BufferedPublisher::new(config, Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();
    assert_eq!(report.acknowledged, 60);
    assert_eq!(log.message_count(TOPIC), 60);

    for vehicle in 0..3u64 {
        let key = format!("51B-{:03}", vehicle);
        let stored: Vec<String> = log
            .records_for_key(TOPIC, &key)
            .into_iter()
            .map(|r| {
                let payload: serde_json::Value = serde_json::from_slice(&r.payload).unwrap();
                payload["datetime"].as_str().unwrap().to_string()
            })
            .collect();
        let expected: Vec<String> = rows
            .iter()
            .filter(|row| row.contains(&key))
            .map(|row| row.split(',').next().unwrap().to_string())
            .collect();
        assert_eq!(stored, expected, "order broken for {}", key);

        // tokens are 1-based row numbers
        let enqueued: Vec<u64> = (0..60u64)
            .filter(|i| i % 3 == vehicle)
            .map(|i| i + 1)
            .collect();
        assert_eq!(driver.ledger().ack_order(&key), enqueued.as_slice());
    }
}

// ============================================================================
// Accounting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_accounting_identities_hold() {
    let mut rows = gps_rows(30, 5);
    rows.insert(10, "2024-03-01 09:00:00,,1,1,1,1,false,false".to_string());
    rows.insert(20, "2024-03-01 09:00:01,51B-001,1,north,1,1,false,false".to_string());

    let file = csv_file(&rows);
    let log = Arc::new(MemoryLog::new(3));
    log.inject(Fault::Fail(TransportErrorKind::MessageTooLarge));
    let config = PublisherConfig {
        queue_max_messages: 12,
        batch_size_bytes: 512,
        ..Default::default()
    };
    let publisher = BufferedPublisher::new(config, Arc::clone(&log)).unwrap();
    let mut driver = IngestionDriver::new(publisher, driver_config());

    let report = driver.ingest_file(file.path()).await.unwrap();
    let acc = &report.accounting;

    assert_eq!(acc.total_seen, 32);
    assert_eq!(
        acc.total_seen,
        acc.normalization_failed + acc.sent + acc.enqueue_rejected
    );
    assert_eq!(
        acc.sent,
        acc.acknowledged + acc.delivery_failed + acc.unresolved
    );
    assert_eq!(report.acknowledged + report.failed, report.total);
    assert_eq!(acc.anomalies, 0);
    assert_eq!(acc.normalization_failed, 1);
    assert_eq!(log.message_count(TOPIC) as u64, report.acknowledged);
}
