//! Buffer integration tests
//!
//! Drives buffers against a recording driver and the in-memory driver:
//! - Size-triggered flushes in linear and aggregating mode
//! - Concurrent writers sharing one buffer
//! - Writes accepted while a flush is stuck in the driver
//! - Timer-driven flushes on a paused clock
//! - Shutdown draining through the registry
//! - Flush failures and post-shutdown writes

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kuba_tally::buffer::{Buffer, BufferConfig, BufferRegistry, BufferState};
use kuba_tally::driver::{MemoryDriver, StorageDriver};
use kuba_tally::key::BucketKey;
use kuba_tally::time::{Granularity, TimeBucketer};
use kuba_tally::types::{Operation, Values};
use kuba_tally::StorageError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Recording Driver
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Call {
    operation: Operation,
    keys: Vec<BucketKey>,
    values: Values,
}

/// Driver that records calls and optionally fails every write
#[derive(Default)]
struct RecordingDriver {
    calls: Mutex<Vec<Call>>,
    failing: AtomicBool,
}

impl RecordingDriver {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: Operation, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("backend unavailable".to_string()));
        }
        self.calls.lock().push(Call {
            operation,
            keys: keys.to_vec(),
            values: values.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for RecordingDriver {
    fn driver_id(&self) -> &str {
        "recording"
    }

    async fn inc(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        self.record(Operation::Inc, keys, values)
    }

    async fn set(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        self.record(Operation::Set, keys, values)
    }

    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError> {
        Ok(vec![Values::new(); keys.len()])
    }
}

/// Driver whose first `inc` parks until released
#[derive(Default)]
struct GatedDriver {
    entered: Notify,
    release: Notify,
    opened: AtomicBool,
    calls: Mutex<Vec<Values>>,
}

#[async_trait]
impl StorageDriver for GatedDriver {
    fn driver_id(&self) -> &str {
        "gated"
    }

    async fn inc(&self, _keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.calls.lock().push(values.clone());
        Ok(())
    }

    async fn set(&self, _keys: &[BucketKey], _values: &Values) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError> {
        Ok(vec![Values::new(); keys.len()])
    }
}

fn instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
}

fn key(name: &str) -> BucketKey {
    TimeBucketer::default().bucket_key(name, instant(), Granularity::Hour)
}

fn c(n: i32) -> Values {
    Values::new().with("c", n)
}

// =============================================================================
// Size-triggered flushes
// =============================================================================

#[tokio::test]
async fn test_linear_threshold_two_keeps_values_apart() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(2, false)).unwrap();

    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    buffer.inc(&[key("k")], &c(3)).await.unwrap();

    let calls = driver.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.operation == Operation::Inc));
    assert_eq!(calls[0].values, c(1));
    assert_eq!(calls[1].values, c(3));
}

#[tokio::test]
async fn test_aggregating_threshold_two_merges_pairs() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(2, true)).unwrap();

    for _ in 0..4 {
        buffer.inc(&[key("k")], &c(1)).await.unwrap();
    }

    let calls = driver.calls();
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert_eq!(call.operation, Operation::Inc);
        assert_eq!(call.keys, vec![key("k")]);
        assert_eq!(call.values, c(2));
    }
}

#[tokio::test]
async fn test_aggregating_set_keeps_last_write() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(10, true)).unwrap();

    buffer.set(&[key("g")], &Values::new().with("t", 1.5).with("u", 1)).await.unwrap();
    buffer.set(&[key("g")], &Values::new().with("t", 9.0)).await.unwrap();
    buffer.flush().await.unwrap();

    let calls = driver.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::Set);
    assert_eq!(calls[0].values, Values::new().with("t", 9.0));
}

#[tokio::test]
async fn test_inc_and_set_on_same_key_stay_separate() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(10, true)).unwrap();

    buffer.inc(&[key("m")], &c(1)).await.unwrap();
    buffer.set(&[key("m")], &c(5)).await.unwrap();
    buffer.inc(&[key("m")], &c(1)).await.unwrap();
    assert_eq!(buffer.len(), 2);

    buffer.flush().await.unwrap();
    let ops: Vec<Operation> = driver.calls().iter().map(|call| call.operation).collect();
    assert_eq!(ops.len(), 2);
    assert!(ops.contains(&Operation::Inc));
    assert!(ops.contains(&Operation::Set));
}

#[tokio::test]
async fn test_queued_values_are_copies() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(10, false)).unwrap();

    let mut values = c(1);
    buffer.inc(&[key("k")], &values).await.unwrap();
    values.insert("c", 100);
    buffer.flush().await.unwrap();

    assert_eq!(driver.calls()[0].values, c(1));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_lose_nothing() {
    let driver = Arc::new(MemoryDriver::new());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(7, true)).unwrap();

    let mut handles = Vec::new();
    for task in 0..8 {
        let buffer = buffer.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..250 {
                let name = if (task + i) % 2 == 0 { "even" } else { "odd" };
                buffer.inc(&[key(name), key("all")], &c(1)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    buffer.shutdown().await.unwrap();

    let totals = driver
        .get(&[key("even"), key("odd"), key("all")])
        .await
        .unwrap();
    let even = totals[0].number("c").unwrap_or(0.0);
    let odd = totals[1].number("c").unwrap_or(0.0);
    assert_eq!(even + odd, 2_000.0);
    assert_eq!(totals[2].number("c"), Some(2_000.0));
    assert!(buffer.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_proceed_while_flush_waits_on_driver() {
    let driver = Arc::new(GatedDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(100, false)).unwrap();
    buffer.inc(&[key("k")], &c(1)).await.unwrap();

    let flushing = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.flush().await })
    };
    driver.entered.notified().await;

    // the queue was handed off before the driver call began
    tokio::time::timeout(Duration::from_secs(5), buffer.inc(&[key("k")], &c(2)))
        .await
        .expect("enqueue blocked behind an in-flight flush")
        .unwrap();
    assert_eq!(buffer.len(), 1);
    assert!(driver.calls.lock().is_empty());

    driver.release.notify_one();
    assert_eq!(flushing.await.unwrap().unwrap(), 1);
    assert_eq!(buffer.flush().await.unwrap(), 1);
    assert_eq!(*driver.calls.lock(), vec![c(1), c(2)]);
}

// =============================================================================
// Timer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_each_interval() {
    let driver = Arc::new(RecordingDriver::default());
    let config = BufferConfig {
        flush_interval: Duration::from_secs(5),
        max_size: 1_000,
        aggregate: true,
        async_flush: true,
    };
    let buffer = Buffer::new(driver.clone(), config).unwrap();

    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(driver.calls().len(), 1);
    assert_eq!(driver.calls()[0].values, c(2));

    // empty intervals produce no calls
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(driver.calls().len(), 1);

    buffer.inc(&[key("k")], &c(4)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(driver.calls().len(), 2);

    buffer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_failure_does_not_stop_timer() {
    let driver = Arc::new(RecordingDriver::default());
    let config = BufferConfig {
        flush_interval: Duration::from_secs(1),
        max_size: 1_000,
        aggregate: false,
        async_flush: true,
    };
    let buffer = Buffer::new(driver.clone(), config).unwrap();

    driver.failing.store(true, Ordering::SeqCst);
    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(buffer.stats().flush_failures, 1);
    assert!(buffer.is_empty());

    driver.failing.store(false, Ordering::SeqCst);
    buffer.inc(&[key("k")], &c(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(driver.calls().len(), 1);
    assert_eq!(driver.calls()[0].values, c(2));
}

#[tokio::test]
async fn test_zero_interval_never_starts_timer() {
    let driver = Arc::new(RecordingDriver::default());
    let config = BufferConfig {
        flush_interval: Duration::ZERO,
        max_size: 100,
        aggregate: false,
        async_flush: true,
    };
    let buffer = Buffer::new(driver.clone(), config).unwrap();

    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(driver.calls().is_empty());
    assert_eq!(buffer.len(), 1);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(100, false)).unwrap();

    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    buffer.set(&[key("k")], &c(2)).await.unwrap();

    buffer.shutdown().await.unwrap();
    assert_eq!(driver.calls().len(), 2);
    buffer.shutdown().await.unwrap();
    buffer.shutdown().await.unwrap();
    assert_eq!(driver.calls().len(), 2);
    assert_eq!(buffer.state(), BufferState::ShutDown);
}

#[tokio::test]
async fn test_shutdown_reports_final_flush_failure() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(100, false)).unwrap();

    buffer.inc(&[key("k")], &c(1)).await.unwrap();
    driver.failing.store(true, Ordering::SeqCst);

    assert!(buffer.shutdown().await.is_err());
    assert_eq!(buffer.state(), BufferState::ShutDown);
    assert_eq!(buffer.stats().actions_dropped, 1);

    // no retry on a second shutdown
    driver.failing.store(false, Ordering::SeqCst);
    buffer.shutdown().await.unwrap();
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_writes_after_shutdown_go_straight_to_driver() {
    let driver = Arc::new(RecordingDriver::default());
    let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(100, true)).unwrap();
    buffer.shutdown().await.unwrap();

    buffer.inc(&[key("late")], &c(1)).await.unwrap();
    buffer.inc(&[key("late")], &c(1)).await.unwrap();

    assert_eq!(driver.calls().len(), 2);
    assert_eq!(buffer.stats().passthrough_writes, 2);
}

#[tokio::test]
async fn test_registry_flush_swallows_errors() {
    let registry = BufferRegistry::new();
    let healthy = Arc::new(RecordingDriver::default());
    let broken = Arc::new(RecordingDriver::default());
    broken.failing.store(true, Ordering::SeqCst);

    let a = Buffer::with_registry(healthy.clone(), BufferConfig::synchronous(100, false), &registry)
        .unwrap();
    let b = Buffer::with_registry(broken.clone(), BufferConfig::synchronous(100, false), &registry)
        .unwrap();
    a.inc(&[key("k")], &c(1)).await.unwrap();
    b.inc(&[key("k")], &c(1)).await.unwrap();

    assert_eq!(registry.flush_all().await, 2);
    assert_eq!(healthy.calls().len(), 1);
    assert_eq!(b.state(), BufferState::ShutDown);
    assert!(registry.is_empty());
}
