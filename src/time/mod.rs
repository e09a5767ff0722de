//! Calendar bucketing for time-series keys
//!
//! - `granularity` - Bucket sizes and the registry of known tokens
//! - `bucketer` - Timezone-aware truncation, stepping and timelines

mod bucketer;
mod granularity;

pub use bucketer::{parse_timestamp, TimeBucketer};
pub use granularity::Granularity;
