//! Live buffer registry
//!
//! The entry point owns one `Arc<BufferRegistry>` and hands it to every
//! buffer it creates. At exit it calls [`BufferRegistry::flush_all`]; for
//! termination signals it either installs the built-in handler or wires its
//! own cancellation future through [`BufferRegistry::shutdown_on`].

use super::Buffer;
use crate::driver::StorageDriver;
use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which termination signal arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl-C / SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownSignal {
    /// Conventional `128 + signo` exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

/// Wait for Ctrl-C or SIGTERM
///
/// Each call registers its own listeners; other consumers of the same
/// signals keep receiving them.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownSignal::Interrupt,
        _ = terminate => ShutdownSignal::Terminate,
    }
}

/// Set of buffers that still need draining
///
/// Holds weak references only; a buffer belongs to whoever created it.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: Mutex<HashMap<u64, Weak<Buffer>>>,
    next_id: AtomicU64,
    signals_installed: AtomicBool,
}

impl BufferRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, buffer: Weak<Buffer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(id, buffer);
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.buffers.lock().remove(&id);
    }

    /// Registered buffers that are still alive
    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .values()
            .filter(|b| b.strong_count() > 0)
            .count()
    }

    /// Whether no live buffer is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every live buffer
    ///
    /// Errors are logged and swallowed. Returns how many buffers were shut
    /// down.
    pub async fn flush_all(&self) -> usize {
        let snapshot: Vec<Arc<Buffer>> = {
            let mut buffers = self.buffers.lock();
            buffers.retain(|_, b| b.strong_count() > 0);
            buffers.values().filter_map(Weak::upgrade).collect()
        };

        let count = snapshot.len();
        for buffer in snapshot {
            if let Err(e) = buffer.shutdown().await {
                warn!(
                    driver = buffer.driver_id(),
                    error = %e,
                    "Buffer flush failed during shutdown"
                );
            }
        }

        if count > 0 {
            info!(buffers = count, "Flushed all buffers");
        }
        count
    }

    /// Flush everything once `trigger` completes
    pub fn shutdown_on<F>(self: &Arc<Self>, trigger: F) -> JoinHandle<usize>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            trigger.await;
            debug!("Shutdown trigger fired");
            registry.flush_all().await
        })
    }

    /// Drain all buffers and exit when Ctrl-C or SIGTERM arrives
    ///
    /// Installs at most once per registry; returns `Ok(true)` when this call
    /// installed the handler. The process exits with `128 + signo` after the
    /// flush.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<bool, Error> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Configuration("signal handler requires a running tokio runtime".to_string())
        })?;

        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let registry = Arc::clone(self);
        runtime.spawn(async move {
            let signal = shutdown_signal().await;
            info!(signal = ?signal, "Shutdown signal received, flushing buffers");
            registry.flush_all().await;
            std::process::exit(signal.exit_code());
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, BufferState};
    use crate::driver::MemoryDriver;
    use crate::time::{Granularity, TimeBucketer};
    use crate::types::Values;
    use chrono::{TimeZone, Utc};
    use tokio::sync::oneshot;

    fn key() -> crate::key::BucketKey {
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        TimeBucketer::default().bucket_key("signups", at, Granularity::Day)
    }

    #[tokio::test]
    async fn test_flush_all_drains_and_unregisters() {
        let registry = BufferRegistry::new();
        let driver = Arc::new(MemoryDriver::new());

        let a = Buffer::with_registry(driver.clone(), BufferConfig::synchronous(10, true), &registry)
            .unwrap();
        let b = Buffer::with_registry(driver.clone(), BufferConfig::synchronous(10, false), &registry)
            .unwrap();
        assert_eq!(registry.len(), 2);

        a.inc(&[key()], &Values::new().with("c", 1)).await.unwrap();
        b.inc(&[key()], &Values::new().with("c", 2)).await.unwrap();

        assert_eq!(registry.flush_all().await, 2);
        assert!(registry.is_empty());
        assert_eq!(a.state(), BufferState::ShutDown);
        assert_eq!(b.state(), BufferState::ShutDown);
        assert_eq!(driver.get(&[key()]).await.unwrap()[0].number("c"), Some(3.0));

        assert_eq!(registry.flush_all().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_buffers_are_skipped() {
        let registry = BufferRegistry::new();
        let driver = Arc::new(MemoryDriver::new());

        let kept = Buffer::with_registry(driver.clone(), BufferConfig::synchronous(5, false), &registry)
            .unwrap();
        drop(
            Buffer::with_registry(driver, BufferConfig::synchronous(5, false), &registry).unwrap(),
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.flush_all().await, 1);
        assert_eq!(kept.state(), BufferState::ShutDown);
    }

    #[tokio::test]
    async fn test_manual_shutdown_unregisters() {
        let registry = BufferRegistry::new();
        let buffer = Buffer::with_registry(
            Arc::new(MemoryDriver::new()),
            BufferConfig::synchronous(5, false),
            &registry,
        )
        .unwrap();

        buffer.shutdown().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_on_trigger() {
        let registry = BufferRegistry::new();
        let driver = Arc::new(MemoryDriver::new());
        let buffer = Buffer::with_registry(driver.clone(), BufferConfig::synchronous(5, true), &registry)
            .unwrap();
        buffer.inc(&[key()], &Values::new().with("c", 4)).await.unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = registry.shutdown_on(async move {
            let _ = rx.await;
        });

        assert!(driver.is_empty());
        tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(driver.get(&[key()]).await.unwrap()[0].number("c"), Some(4.0));
    }

    #[tokio::test]
    async fn test_signal_handler_installs_once() {
        let registry = BufferRegistry::new();
        assert!(registry.install_signal_handler().unwrap());
        assert!(!registry.install_signal_handler().unwrap());
    }

    #[test]
    fn test_signal_handler_needs_runtime() {
        let registry = BufferRegistry::new();
        assert!(matches!(
            registry.install_signal_handler(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), 130);
        assert_eq!(ShutdownSignal::Terminate.exit_code(), 143);
    }
}
