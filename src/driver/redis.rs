//! Redis storage driver
//!
//! Each bucket is one Redis hash addressed by the bucket's full identifier.
//! Nested values are flattened into dotted hash fields:
//!
//! ```text
//! app::visits::1d::1704067200   → HASH { "hits": "12", "status.ok": "11", "status.err": "1" }
//! app::latest::visits           → STRING '{"at":"2024-01-01T10:00:00Z","values":{...}}'
//! ```
//!
//! Increments use `HINCRBYFLOAT`, so concurrent processes can share keys
//! without coordination; every call runs in one MULTI/EXEC pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_tally::driver::{RedisDriver, RedisDriverConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisDriverConfig::with_url("redis://127.0.0.1:6379").prefix("app");
//! let driver = RedisDriver::connect(config).await?;
//! # Ok(())
//! # }
//! ```

use super::{LatestValue, StorageDriver};
use crate::error::StorageError;
use crate::key::{BucketKey, IdentifierMode};
use crate::types::Values;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Separator between nested field names inside a bucket hash
pub const FIELD_SEPARATOR: &str = ".";

/// Configuration for [`RedisDriver`]
#[derive(Clone, Debug)]
pub struct RedisDriverConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Prefix assigned to keys that do not carry one
    pub prefix: Option<String>,

    /// Separator joining identifier components
    /// Default: "::"
    pub separator: String,

    /// Timeout for establishing the connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,
}

impl Default for RedisDriverConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: None,
            separator: super::memory::DEFAULT_SEPARATOR.to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisDriverConfig {
    /// Create a new config with the specified URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the identifier separator
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    fn keyspace(&self) -> Keyspace {
        Keyspace {
            prefix: self.prefix.clone(),
            separator: self.separator.clone(),
        }
    }
}

/// Key naming for the Redis layout
#[derive(Clone, Debug)]
struct Keyspace {
    prefix: Option<String>,
    separator: String,
}

impl Keyspace {
    fn bucket(&self, key: &BucketKey) -> Result<String, StorageError> {
        let mut key = key.clone();
        if let Some(prefix) = &self.prefix {
            key.assign_prefix(prefix);
        }
        Ok(key
            .identifier(IdentifierMode::Full, Some(&self.separator))?
            .to_string())
    }

    /// `prefix` wins over the configured one
    fn latest(&self, prefix: Option<&str>, name: &str) -> String {
        match prefix.or(self.prefix.as_deref()) {
            Some(prefix) => [prefix, "latest", name].join(&self.separator),
            None => ["latest", name].join(&self.separator),
        }
    }
}

/// Driver persisting buckets as Redis hashes
pub struct RedisDriver {
    /// Multiplexed connection (cloned per command, Redis handles multiplexing)
    connection: MultiplexedConnection,
    keyspace: Keyspace,
}

impl RedisDriver {
    /// Connect to Redis
    pub async fn connect(config: RedisDriverConfig) -> Result<Self, StorageError> {
        if config.url.is_empty() {
            return Err(StorageError::Connection("Redis URL cannot be empty".to_string()));
        }
        if config.separator.is_empty() {
            return Err(StorageError::MissingSeparator(IdentifierMode::Full));
        }

        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(
            config.connection_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            StorageError::Connection(format!(
                "timed out after {:?} connecting to Redis",
                config.connection_timeout
            ))
        })??;

        info!(prefix = ?config.prefix, "Connected Redis storage driver");

        Ok(Self {
            connection,
            keyspace: config.keyspace(),
        })
    }

    fn bucket_keys(&self, keys: &[BucketKey]) -> Result<Vec<String>, StorageError> {
        keys.iter().map(|k| self.keyspace.bucket(k)).collect()
    }
}

#[async_trait]
impl StorageDriver for RedisDriver {
    fn driver_id(&self) -> &str {
        "redis-v1"
    }

    async fn inc(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        values.ensure_finite()?;
        let fields = values.flatten(FIELD_SEPARATOR);
        if keys.is_empty() || fields.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in self.bucket_keys(keys)? {
            for (field, delta) in &fields {
                pipe.cmd("HINCRBYFLOAT").arg(&id).arg(field).arg(*delta).ignore();
            }
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!(keys = keys.len(), fields = fields.len(), "Redis inc");
        Ok(())
    }

    async fn set(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        values.ensure_finite()?;
        let fields = values.flatten(FIELD_SEPARATOR);
        if keys.is_empty() || fields.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in self.bucket_keys(keys)? {
            pipe.hset_multiple(id, &fields).ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!(keys = keys.len(), fields = fields.len(), "Redis set");
        Ok(())
    }

    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in self.bucket_keys(keys)? {
            pipe.hgetall(id);
        }

        let mut conn = self.connection.clone();
        let rows: Vec<HashMap<String, f64>> = pipe.query_async(&mut conn).await?;
        rows.into_iter()
            .map(|row| Values::unflatten(row, FIELD_SEPARATOR))
            .collect()
    }

    async fn ping(
        &self,
        prefix: Option<&str>,
        name: &str,
        at: DateTime<Utc>,
        values: &Values,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&LatestValue {
            at,
            values: values.clone(),
        })?;
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(self.keyspace.latest(prefix, name), payload)
            .await?;
        Ok(())
    }

    async fn scan(
        &self,
        prefix: Option<&str>,
        name: &str,
    ) -> Result<Option<LatestValue>, StorageError> {
        let mut conn = self.connection.clone();
        let payload: Option<String> = conn.get(self.keyspace.latest(prefix, name)).await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(StorageError::from))
            .transpose()
    }
}
