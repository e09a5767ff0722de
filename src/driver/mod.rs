//! Storage driver contract
//!
//! The buffering and orchestration layers only ever talk to storage through
//! [`StorageDriver`]. Each backend gets one implementing type:
//!
//! - [`MemoryDriver`] - In-process maps, any identifier mode
//! - [`RedisDriver`] - One Redis hash per bucket, full identifiers
//!
//! [`Buffer`](crate::buffer::Buffer) implements the trait as well, so callers
//! can write through a buffer or straight to a driver without caring which.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryDriver;
pub use self::redis::{RedisDriver, RedisDriverConfig};

use crate::error::StorageError;
use crate::key::BucketKey;
use crate::types::{Operation, Values};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistence contract for bucketed values
///
/// Every method must be safe to call concurrently for disjoint keys. Drivers
/// convert between nested [`Values`] and whatever flat layout they persist.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Unique identifier for this driver
    fn driver_id(&self) -> &str;

    /// Add `values` to what is stored under each key, creating missing records
    async fn inc(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError>;

    /// Overwrite the leaves named in `values` under each key
    async fn set(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError>;

    /// Fetch one map per key, in key order, empty for keys never written
    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError>;

    /// Record the most recent values seen for `name`
    ///
    /// `prefix` namespaces the record the same way a key prefix does; when
    /// `None` the driver's own prefix applies.
    async fn ping(
        &self,
        _prefix: Option<&str>,
        _name: &str,
        _at: DateTime<Utc>,
        _values: &Values,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("ping"))
    }

    /// Read back what the last [`ping`](StorageDriver::ping) stored under the same prefix
    async fn scan(
        &self,
        _prefix: Option<&str>,
        _name: &str,
    ) -> Result<Option<LatestValue>, StorageError> {
        Ok(None)
    }
}

/// Dispatch a pending operation to the matching driver method
pub(crate) async fn apply<D>(
    driver: &D,
    operation: Operation,
    keys: &[BucketKey],
    values: &Values,
) -> Result<(), StorageError>
where
    D: StorageDriver + ?Sized,
{
    match operation {
        Operation::Inc => driver.inc(keys, values).await,
        Operation::Set => driver.set(keys, values).await,
    }
}

/// Latest values recorded for a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestValue {
    /// When the values were recorded
    pub at: DateTime<Utc>,
    /// The recorded values
    pub values: Values,
}
