//! Kuba Tally - Calendar-bucketed metrics with buffered writes
//!
//! This library records numeric observations under a name and a timestamp
//! and reads them back as series of calendar buckets:
//! - Timezone-aware bucketing from minutes to years, configurable week start
//! - Three identifier modes adapting bucket addresses to backend key shapes
//! - Linear or aggregating write buffers with size and timer flushes
//! - A registry draining every buffer at exit or on termination signals
//! - In-memory and Redis storage drivers behind one async trait

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod key;
pub mod time;
pub mod types;

/// Write buffering, aggregation and shutdown draining
pub mod buffer;

/// Configuration management with TOML support
pub mod config;

/// Storage driver contract and bundled backends
pub mod driver;

/// Write/read orchestration across granularities
pub mod tally;

// Re-export main types
pub use buffer::{Buffer, BufferConfig, BufferRegistry};
pub use driver::StorageDriver;
pub use error::{Error, Result, StorageError};
pub use key::{BucketKey, Identifier, IdentifierMode};
pub use tally::{SeriesPoint, Tally, TallyBuilder};
pub use time::{Granularity, TimeBucketer};
pub use types::{Value, Values};
