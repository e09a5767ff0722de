//! Write buffering in front of a storage driver
//!
//! A [`Buffer`] collects `inc`/`set` writes in a [`BufferQueue`] and forwards
//! them to its driver when one of three things happens:
//!
//! - the writes accepted since the last drain reach the size threshold,
//!   counting merged writes too (checked after every write)
//! - the background timer fires (async buffers with a non-zero interval)
//! - [`Buffer::flush`] or [`Buffer::shutdown`] is called
//!
//! # Architecture
//!
//! - `config` - Flush thresholds and timer settings
//! - `queue` - Linear or aggregating pending-action container
//! - `registry` - Live buffers drained together at process shutdown
//!
//! # Locking
//!
//! One mutex per buffer guards the queue. It is held only to store or to
//! drain; driver I/O happens after it is released, so writers never wait on
//! a slow backend. Several flushes may be in flight at once, each forwarding
//! whatever it drained.
//!
//! # Delivery
//!
//! At most once. When a driver call fails, the error reaches whoever called
//! `flush`, and the rest of that drained batch is dropped rather than
//! requeued.
//!
//! # Example
//!
//! ```rust
//! use kuba_tally::buffer::{Buffer, BufferConfig};
//! use kuba_tally::driver::{MemoryDriver, StorageDriver};
//! use kuba_tally::time::{Granularity, TimeBucketer};
//! use kuba_tally::types::Values;
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Arc::new(MemoryDriver::new());
//! let buffer = Buffer::new(driver.clone(), BufferConfig::synchronous(10, true))?;
//!
//! let key = TimeBucketer::default().bucket_key("visits", Utc::now(), Granularity::Day);
//! buffer.inc(&[key.clone()], &Values::new().with("c", 1)).await?;
//! buffer.inc(&[key.clone()], &Values::new().with("c", 1)).await?;
//! assert_eq!(buffer.len(), 1);
//!
//! buffer.shutdown().await?;
//! assert_eq!(driver.get(&[key]).await?[0].number("c"), Some(2.0));
//! # Ok(())
//! # }
//! ```

mod config;
mod queue;
mod registry;

pub use config::{BufferConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_SIZE};
pub use queue::{BufferQueue, PendingAction, QueueMode, Stored};
pub use registry::{shutdown_signal, BufferRegistry, ShutdownSignal};

use crate::driver::{self, LatestValue, StorageDriver};
use crate::error::{Error, StorageError};
use crate::key::BucketKey;
use crate::types::{Operation, Values};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Accepting and buffering writes
    Active,
    /// Stopping the timer and draining
    ShuttingDown,
    /// Drained; later writes go straight to the driver
    ShutDown,
}

impl BufferState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BufferState::Active,
            1 => BufferState::ShuttingDown,
            _ => BufferState::ShutDown,
        }
    }
}

const STATE_ACTIVE: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_SHUT_DOWN: u8 = 2;

/// Queue plus the flag that closes it, guarded together
struct Pending {
    queue: BufferQueue,
    closed: bool,
}

/// Handle on the background flush task
struct FlushTimer {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Buffer counters
#[derive(Debug, Default)]
struct BufferCounters {
    writes: AtomicU64,
    merged: AtomicU64,
    flushes: AtomicU64,
    actions_flushed: AtomicU64,
    flush_failures: AtomicU64,
    actions_dropped: AtomicU64,
    passthrough_writes: AtomicU64,
}

/// Snapshot of buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Writes accepted into the queue
    pub writes: u64,
    /// Writes folded into an existing action
    pub merged: u64,
    /// Flushes that forwarded at least one action
    pub flushes: u64,
    /// Actions delivered to the driver
    pub actions_flushed: u64,
    /// Flushes interrupted by a driver error
    pub flush_failures: u64,
    /// Actions lost to driver errors
    pub actions_dropped: u64,
    /// Writes sent straight to the driver after shutdown
    pub passthrough_writes: u64,
}

/// Write buffer in front of one storage driver
pub struct Buffer {
    config: BufferConfig,
    driver: Arc<dyn StorageDriver>,
    pending: Mutex<Pending>,
    state: AtomicU8,
    timer: Mutex<Option<FlushTimer>>,
    registration: Option<(Arc<BufferRegistry>, u64)>,
    counters: BufferCounters,
}

impl Buffer {
    /// Create an unregistered buffer
    ///
    /// When the config enables the timer this must run inside a tokio
    /// runtime; outside one it fails with [`Error::Configuration`].
    pub fn new(driver: Arc<dyn StorageDriver>, config: BufferConfig) -> Result<Arc<Self>, Error> {
        Self::create(driver, config, None)
    }

    /// Create a buffer tracked by `registry` until it shuts down
    pub fn with_registry(
        driver: Arc<dyn StorageDriver>,
        config: BufferConfig,
        registry: &Arc<BufferRegistry>,
    ) -> Result<Arc<Self>, Error> {
        Self::create(driver, config, Some(registry))
    }

    fn create(
        driver: Arc<dyn StorageDriver>,
        config: BufferConfig,
        registry: Option<&Arc<BufferRegistry>>,
    ) -> Result<Arc<Self>, Error> {
        let runtime = if config.timer_enabled() {
            Some(tokio::runtime::Handle::try_current().map_err(|_| {
                Error::Configuration(
                    "buffer flush timer requires a running tokio runtime".to_string(),
                )
            })?)
        } else {
            None
        };

        let buffer = Arc::new_cyclic(|weak| {
            let registration = registry.map(|r| (Arc::clone(r), r.register(weak.clone())));
            Self {
                pending: Mutex::new(Pending {
                    queue: BufferQueue::new(config.queue_mode()),
                    closed: false,
                }),
                config,
                driver,
                state: AtomicU8::new(STATE_ACTIVE),
                timer: Mutex::new(None),
                registration,
                counters: BufferCounters::default(),
            }
        });

        if let Some(runtime) = runtime {
            buffer.start_timer(&runtime);
        }

        debug!(
            driver = buffer.driver.driver_id(),
            max_size = buffer.config.effective_max_size(),
            aggregate = buffer.config.aggregate,
            timer = buffer.config.timer_enabled(),
            "Buffer created"
        );

        Ok(buffer)
    }

    /// Spawn the background flush loop
    ///
    /// The task holds only a weak reference, so an abandoned buffer is not
    /// kept alive by its own timer.
    fn start_timer(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let period = self.config.flush_interval;
        let weak = Arc::downgrade(self);

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let Some(buffer) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = buffer.flush().await {
                            warn!(error = %e, "Timed buffer flush failed");
                        }
                    }
                }
            }

            debug!("Buffer flush timer stopped");
        });

        *self.timer.lock() = Some(FlushTimer {
            stop: stop_tx,
            handle,
        });
    }

    /// Configuration in use
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Pending actions
    pub fn len(&self) -> usize {
        self.pending.lock().queue.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying driver
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> BufferStats {
        let c = &self.counters;
        BufferStats {
            writes: c.writes.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            actions_flushed: c.actions_flushed.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            actions_dropped: c.actions_dropped.load(Ordering::Relaxed),
            passthrough_writes: c.passthrough_writes.load(Ordering::Relaxed),
        }
    }

    /// Forward everything pending to the driver
    ///
    /// Returns the number of actions delivered; an empty queue is a no-op.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        self.drain_and_forward(false).await
    }

    /// Stop the timer, flush what is left and leave the registry
    ///
    /// Only the first call does anything; later calls return `Ok(())`. The
    /// final flush's error, if any, is returned after deregistration.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        if self
            .state
            .compare_exchange(
                STATE_ACTIVE,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        debug!(driver = self.driver.driver_id(), "Buffer shutting down");
        self.stop_timer().await;

        let result = self.drain_and_forward(true).await;
        self.state.store(STATE_SHUT_DOWN, Ordering::SeqCst);

        if let Some((registry, id)) = &self.registration {
            registry.unregister(*id);
        }

        match &result {
            Ok(flushed) => info!(flushed = flushed, "Buffer shut down"),
            Err(e) => warn!(error = %e, "Buffer shut down with a failed final flush"),
        }
        result.map(|_| ())
    }

    async fn stop_timer(&self) {
        let timer = self.timer.lock().take();
        let Some(FlushTimer { stop, handle }) = timer else {
            return;
        };

        // Best-effort wake; dropping the sender also ends the loop
        let _ = stop.try_send(());
        drop(stop);

        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Buffer flush timer ended abnormally");
            }
        }
    }

    async fn enqueue(
        &self,
        operation: Operation,
        keys: &[BucketKey],
        values: &Values,
    ) -> Result<(), StorageError> {
        let size = {
            let mut pending = self.pending.lock();
            if pending.closed {
                None
            } else {
                let stored = pending.queue.store(operation, keys.to_vec(), values)?;
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                if stored == Stored::Merged {
                    self.counters.merged.fetch_add(1, Ordering::Relaxed);
                }
                Some(pending.queue.accepted())
            }
        };

        match size {
            Some(size) if size >= self.config.effective_max_size() => {
                self.flush().await?;
            },
            Some(_) => {},
            None => {
                self.counters
                    .passthrough_writes
                    .fetch_add(1, Ordering::Relaxed);
                debug!(operation = %operation, "Buffer closed, writing through");
                driver::apply(self.driver.as_ref(), operation, keys, values).await?;
            },
        }

        Ok(())
    }

    /// Drain under the lock, then forward without it
    async fn drain_and_forward(&self, close: bool) -> Result<usize, StorageError> {
        let actions = {
            let mut pending = self.pending.lock();
            if close {
                pending.closed = true;
            }
            if pending.queue.is_empty() {
                return Ok(0);
            }
            pending.queue.drain()
        };

        let total = actions.len();
        for (delivered, action) in actions.into_iter().enumerate() {
            if let Err(e) = driver::apply(
                self.driver.as_ref(),
                action.operation,
                &action.keys,
                &action.values,
            )
            .await
            {
                let dropped = (total - delivered) as u64;
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .actions_dropped
                    .fetch_add(dropped, Ordering::Relaxed);
                self.counters
                    .actions_flushed
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                warn!(
                    error = %e,
                    delivered = delivered,
                    dropped = dropped,
                    "Buffer flush failed, dropping the rest of the batch"
                );
                return Err(e);
            }
        }

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .actions_flushed
            .fetch_add(total as u64, Ordering::Relaxed);
        debug!(actions = total, "Buffer flushed");
        Ok(total)
    }
}

#[async_trait]
impl StorageDriver for Buffer {
    fn driver_id(&self) -> &str {
        self.driver.driver_id()
    }

    async fn inc(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        self.enqueue(Operation::Inc, keys, values).await
    }

    async fn set(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        self.enqueue(Operation::Set, keys, values).await
    }

    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError> {
        self.driver.get(keys).await
    }

    async fn ping(
        &self,
        prefix: Option<&str>,
        name: &str,
        at: DateTime<Utc>,
        values: &Values,
    ) -> Result<(), StorageError> {
        self.driver.ping(prefix, name, at, values).await
    }

    async fn scan(
        &self,
        prefix: Option<&str>,
        name: &str,
    ) -> Result<Option<LatestValue>, StorageError> {
        self.driver.scan(prefix, name).await
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
        let pending = self.pending.get_mut().queue.len();
        if pending > 0 {
            warn!(pending = pending, "Buffer dropped without shutdown, pending writes lost");
        }
    }
}
