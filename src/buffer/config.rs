//! Buffer configuration and constants
//!
//! Defines the knobs controlling when a [`Buffer`](super::Buffer) flushes.

use super::queue::QueueMode;
use std::time::Duration;

/// Default interval between timer-driven flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of pending actions that triggers a flush
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Configuration for a write buffer
///
/// # Example
///
/// ```rust
/// use kuba_tally::buffer::BufferConfig;
/// use std::time::Duration;
///
/// let config = BufferConfig {
///     flush_interval: Duration::ZERO, // no timer
///     max_size: 0,                    // clamped to 1
///     aggregate: true,
///     async_flush: false,
/// };
///
/// assert_eq!(config.effective_max_size(), 1);
/// assert!(!config.timer_enabled());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Interval between background flushes; zero disables the timer
    pub flush_interval: Duration,
    /// Pending actions that trigger a flush; values below 1 act as 1
    pub max_size: usize,
    /// Merge writes that target the same buckets
    pub aggregate: bool,
    /// Run the background flush timer
    pub async_flush: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_size: DEFAULT_MAX_SIZE,
            aggregate: false,
            async_flush: true,
        }
    }
}

impl BufferConfig {
    /// Synchronous buffer flushing only on size or explicit calls
    pub fn synchronous(max_size: usize, aggregate: bool) -> Self {
        Self {
            flush_interval: Duration::ZERO,
            max_size,
            aggregate,
            async_flush: false,
        }
    }

    /// Size threshold after clamping
    pub fn effective_max_size(&self) -> usize {
        self.max_size.max(1)
    }

    /// Whether a background flush task should run
    pub fn timer_enabled(&self) -> bool {
        self.async_flush && !self.flush_interval.is_zero()
    }

    pub(crate) fn queue_mode(&self) -> QueueMode {
        if self.aggregate {
            QueueMode::Aggregating
        } else {
            QueueMode::Linear
        }
    }
}
