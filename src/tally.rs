//! Write and read orchestration
//!
//! [`Tally`] ties the pieces together: every write is bucketed once per
//! enabled granularity and sent to storage as a single driver call with all
//! keys; every query walks a timeline and reads it back with a single `get`.
//! Storage is either a raw driver or a [`Buffer`] wrapping one.
//!
//! # Example
//!
//! ```rust
//! use kuba_tally::driver::MemoryDriver;
//! use kuba_tally::tally::TallyBuilder;
//! use kuba_tally::time::Granularity;
//! use kuba_tally::types::Values;
//! use chrono::{Duration, Utc};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), kuba_tally::Error> {
//! let tally = TallyBuilder::new()
//!     .with_driver(MemoryDriver::new())
//!     .with_granularities(vec![Granularity::Hour, Granularity::Day])
//!     .without_buffer()
//!     .build()?;
//!
//! let now = Utc::now();
//! tally.track("visits", now, &Values::new().with("hits", 1)).await?;
//!
//! let series = tally
//!     .query("visits", now - Duration::hours(2), now, Granularity::Hour)
//!     .await?;
//! assert_eq!(series.last().and_then(|p| p.values.number("hits")), Some(1.0));
//! # Ok(())
//! # }
//! ```

use crate::buffer::{Buffer, BufferConfig, BufferRegistry};
use crate::config::{Config, DriverKind};
use crate::driver::{LatestValue, MemoryDriver, RedisDriver, RedisDriverConfig, StorageDriver};
use crate::error::{Error, Result, StorageError};
use crate::key::BucketKey;
use crate::time::{Granularity, TimeBucketer};
use crate::types::Values;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// One bucket of a queried series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Bucket start
    pub at: DateTime<Utc>,
    /// Values stored in the bucket, empty when nothing was written
    pub values: Values,
}

/// Builder for [`Tally`]
pub struct TallyBuilder {
    driver: Option<Arc<dyn StorageDriver>>,
    config: Config,
    buffer: Option<BufferConfig>,
    registry: Option<Arc<BufferRegistry>>,
    granularities: Option<Vec<Granularity>>,
    bucketer: Option<TimeBucketer>,
}

impl Default for TallyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TallyBuilder {
    /// Create a builder with default configuration and no driver
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            driver: None,
            buffer: Some(BufferConfig::from(&config.buffer)),
            config,
            registry: None,
            granularities: None,
            bucketer: None,
        }
    }

    /// Set the storage driver
    pub fn with_driver<D>(mut self, driver: D) -> Self
    where
        D: StorageDriver,
    {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Set the storage driver from an existing Arc
    ///
    /// Use this to keep a handle on the driver for direct inspection.
    pub fn with_driver_arc(mut self, driver: Arc<dyn StorageDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Take tracking and buffer settings from a configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.buffer = config
            .buffer
            .enabled
            .then(|| BufferConfig::from(&config.buffer));
        self.config = config;
        self
    }

    /// Register the buffer with `registry` for shutdown draining
    pub fn with_registry(mut self, registry: Arc<BufferRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the configured granularities
    pub fn with_granularities(mut self, granularities: Vec<Granularity>) -> Self {
        self.granularities = Some(granularities);
        self
    }

    /// Override the configured timezone and week start
    pub fn with_bucketer(mut self, bucketer: TimeBucketer) -> Self {
        self.bucketer = Some(bucketer);
        self
    }

    /// Replace the buffer settings
    pub fn with_buffer(mut self, config: BufferConfig) -> Self {
        self.buffer = Some(config);
        self
    }

    /// Write straight to the driver
    pub fn without_buffer(mut self) -> Self {
        self.buffer = None;
        self
    }

    /// Build the engine
    ///
    /// A missing driver is not an error here; storage calls fail with
    /// [`Error::DriverNotConfigured`] instead.
    pub fn build(self) -> Result<Tally> {
        let granularities = match self.granularities {
            Some(list) => list,
            None => self.config.tracking.granularities()?,
        };
        if granularities.is_empty() {
            return Err(Error::Configuration(
                "at least one granularity must be enabled".to_string(),
            ));
        }

        let bucketer = match self.bucketer {
            Some(bucketer) => bucketer,
            None => self.config.tracking.bucketer()?,
        };

        let (storage, buffer) = match (self.driver, self.buffer) {
            (Some(driver), Some(config)) => {
                let buffer = match &self.registry {
                    Some(registry) => Buffer::with_registry(driver, config, registry)?,
                    None => Buffer::new(driver, config)?,
                };
                let storage: Arc<dyn StorageDriver> = buffer.clone();
                (Some(storage), Some(buffer))
            },
            (Some(driver), None) => (Some(driver), None),
            (None, _) => (None, None),
        };

        debug!(
            granularities = ?granularities,
            timezone = %bucketer.timezone(),
            buffered = buffer.is_some(),
            "Tally built"
        );

        Ok(Tally {
            storage,
            buffer,
            bucketer,
            granularities,
            prefix: self.config.tracking.prefix,
        })
    }
}

/// Metrics engine front end
pub struct Tally {
    storage: Option<Arc<dyn StorageDriver>>,
    buffer: Option<Arc<Buffer>>,
    bucketer: TimeBucketer,
    granularities: Vec<Granularity>,
    prefix: Option<String>,
}

impl Tally {
    /// Start building an engine
    pub fn builder() -> TallyBuilder {
        TallyBuilder::new()
    }

    /// Validate `config`, connect the configured driver and build
    pub async fn from_config(config: Config, registry: Option<Arc<BufferRegistry>>) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;

        let storage = &config.storage;
        let driver: Arc<dyn StorageDriver> = match storage.kind()? {
            DriverKind::Memory => {
                let mut memory = MemoryDriver::with_mode(
                    storage.identifier_mode,
                    storage.separator().map(String::from),
                );
                if let Some(prefix) = &config.tracking.prefix {
                    memory = memory.with_prefix(prefix.as_str());
                }
                Arc::new(memory)
            },
            DriverKind::Redis => {
                let mut redis = RedisDriverConfig::with_url(storage.redis_url.as_str())
                    .connection_timeout(storage.connection_timeout());
                if let Some(separator) = storage.separator() {
                    redis = redis.separator(separator);
                }
                if let Some(prefix) = &config.tracking.prefix {
                    redis = redis.prefix(prefix.as_str());
                }
                Arc::new(RedisDriver::connect(redis).await?)
            },
        };
        info!(driver = driver.driver_id(), "Storage driver ready");

        let mut builder = TallyBuilder::new().with_driver_arc(driver).with_config(config);
        if let Some(registry) = registry {
            builder = builder.with_registry(registry);
        }
        builder.build()
    }

    /// Granularities each write is bucketed into
    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    /// Bucketer in use
    pub fn bucketer(&self) -> &TimeBucketer {
        &self.bucketer
    }

    /// Buffer in front of the driver, if buffering is enabled
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    fn storage(&self) -> Result<&Arc<dyn StorageDriver>> {
        self.storage.as_ref().ok_or(Error::DriverNotConfigured)
    }

    fn key(&self, name: &str, at: DateTime<Utc>, granularity: Granularity) -> BucketKey {
        let key = self.bucketer.bucket_key(name, at, granularity);
        match &self.prefix {
            Some(prefix) => key.with_prefix(prefix.as_str()),
            None => key,
        }
    }

    fn keys(&self, name: &str, at: DateTime<Utc>) -> Vec<BucketKey> {
        self.granularities
            .iter()
            .map(|g| self.key(name, at, *g))
            .collect()
    }

    /// Add `values` to the buckets containing `at`
    pub async fn track(&self, name: &str, at: DateTime<Utc>, values: &Values) -> Result<()> {
        let storage = self.storage()?;
        storage.inc(&self.keys(name, at), values).await?;
        Ok(())
    }

    /// Overwrite the named leaves in the buckets containing `at`
    pub async fn set(&self, name: &str, at: DateTime<Utc>, values: &Values) -> Result<()> {
        let storage = self.storage()?;
        storage.set(&self.keys(name, at), values).await?;
        Ok(())
    }

    /// Read every bucket between `from` and `to`
    ///
    /// Buckets never written come back with empty values. Pending buffered
    /// writes are not visible until flushed.
    pub async fn query(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<SeriesPoint>> {
        let timeline = self.bucketer.timeline(from, to, granularity);
        self.read(name, timeline, granularity).await
    }

    /// [`query`](Self::query) with textual bounds
    ///
    /// An unparseable `from` yields an empty series.
    pub async fn query_str(
        &self,
        name: &str,
        from: &str,
        to: &str,
        granularity: Granularity,
    ) -> Result<Vec<SeriesPoint>> {
        let timeline = self.bucketer.timeline_str(from, to, granularity);
        self.read(name, timeline, granularity).await
    }

    async fn read(
        &self,
        name: &str,
        timeline: Vec<DateTime<Utc>>,
        granularity: Granularity,
    ) -> Result<Vec<SeriesPoint>> {
        if !self.granularities.contains(&granularity) {
            return Err(Error::GranularityNotEnabled(granularity));
        }
        let storage = self.storage()?;
        if timeline.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<BucketKey> = timeline
            .iter()
            .map(|at| self.key(name, *at, granularity))
            .collect();
        let rows = storage.get(&keys).await?;
        if rows.len() != keys.len() {
            return Err(StorageError::Backend(format!(
                "driver {} returned {} rows for {} keys",
                storage.driver_id(),
                rows.len(),
                keys.len()
            ))
            .into());
        }

        Ok(timeline
            .into_iter()
            .zip(rows)
            .map(|(at, values)| SeriesPoint { at, values })
            .collect())
    }

    /// Record the latest values for `name` at the current time
    pub async fn ping(&self, name: &str, values: &Values) -> Result<()> {
        self.ping_at(name, Utc::now(), values).await
    }

    /// Record the latest values for `name` at `at`
    pub async fn ping_at(&self, name: &str, at: DateTime<Utc>, values: &Values) -> Result<()> {
        self.storage()?
            .ping(self.prefix.as_deref(), name, at, values)
            .await?;
        Ok(())
    }

    /// Latest values recorded with [`ping`](Self::ping) under this engine's prefix
    pub async fn latest(&self, name: &str) -> Result<Option<LatestValue>> {
        Ok(self.storage()?.scan(self.prefix.as_deref(), name).await?)
    }

    /// Flush buffered writes; returns how many actions were delivered
    pub async fn flush(&self) -> Result<usize> {
        match &self.buffer {
            Some(buffer) => Ok(buffer.flush().await?),
            None => Ok(0),
        }
    }

    /// Shut the buffer down, delivering what is pending
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            buffer.shutdown().await?;
        }
        Ok(())
    }
}
