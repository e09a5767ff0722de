//! In-process storage driver
//!
//! Keeps every bucket in a concurrent map addressed by whichever
//! [`IdentifierMode`] it was configured with. Used as the default backend,
//! for tests, and for single-process deployments that do not need
//! persistence.

use super::{LatestValue, StorageDriver};
use crate::error::StorageError;
use crate::key::{BucketKey, Identifier, IdentifierMode};
use crate::types::Values;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default separator for joined identifiers
pub const DEFAULT_SEPARATOR: &str = "::";

/// Concurrent in-memory driver
#[derive(Debug)]
pub struct MemoryDriver {
    mode: IdentifierMode,
    separator: Option<String>,
    prefix: Option<String>,
    buckets: DashMap<Identifier, Values>,
    latest: DashMap<(Option<String>, String), LatestValue>,
    writes: AtomicU64,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Full identifiers joined with [`DEFAULT_SEPARATOR`]
    pub fn new() -> Self {
        Self::with_mode(IdentifierMode::Full, Some(DEFAULT_SEPARATOR.to_string()))
    }

    /// Driver addressing buckets with `mode`
    ///
    /// `Full` and `Partial` need a separator; writes fail with
    /// [`StorageError::MissingSeparator`] without one.
    pub fn with_mode(mode: IdentifierMode, separator: Option<String>) -> Self {
        Self {
            mode,
            separator,
            prefix: None,
            buckets: DashMap::new(),
            latest: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Prefix assigned to keys that do not carry one
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Identifier mode in use
    pub fn mode(&self) -> IdentifierMode {
        self.mode
    }

    /// Number of buckets holding data
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket holds data
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total `inc`/`set` calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Values stored under an identifier
    pub fn lookup(&self, identifier: &Identifier) -> Option<Values> {
        self.buckets.get(identifier).map(|v| v.clone())
    }

    /// Identifier a key is stored under
    pub fn address(&self, key: &BucketKey) -> Result<Identifier, StorageError> {
        match &self.prefix {
            Some(prefix) if key.prefix().is_none() => {
                let mut key = key.clone();
                key.assign_prefix(prefix);
                key.identifier(self.mode, self.separator.as_deref())
            },
            _ => key.identifier(self.mode, self.separator.as_deref()),
        }
    }

    fn addresses(&self, keys: &[BucketKey]) -> Result<Vec<Identifier>, StorageError> {
        keys.iter().map(|k| self.address(k)).collect()
    }

    fn latest_key(&self, prefix: Option<&str>, name: &str) -> (Option<String>, String) {
        let prefix = prefix.or(self.prefix.as_deref()).map(String::from);
        (prefix, name.to_string())
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn driver_id(&self) -> &str {
        "memory-v1"
    }

    async fn inc(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        let ids = self.addresses(keys)?;
        // Reject the whole call before any bucket is touched
        for id in &ids {
            match self.buckets.get(id) {
                Some(existing) => existing.check_add(values)?,
                None => Values::new().check_add(values)?,
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        for id in ids {
            self.buckets.entry(id).or_default().merge_add(values)?;
        }
        Ok(())
    }

    async fn set(&self, keys: &[BucketKey], values: &Values) -> Result<(), StorageError> {
        values.ensure_finite()?;
        let ids = self.addresses(keys)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        for id in ids {
            self.buckets.entry(id).or_default().replace_leaves(values);
        }
        Ok(())
    }

    async fn get(&self, keys: &[BucketKey]) -> Result<Vec<Values>, StorageError> {
        Ok(self
            .addresses(keys)?
            .iter()
            .map(|id| self.lookup(id).unwrap_or_default())
            .collect())
    }

    async fn ping(
        &self,
        prefix: Option<&str>,
        name: &str,
        at: DateTime<Utc>,
        values: &Values,
    ) -> Result<(), StorageError> {
        self.latest.insert(
            self.latest_key(prefix, name),
            LatestValue {
                at,
                values: values.clone(),
            },
        );
        Ok(())
    }

    async fn scan(
        &self,
        prefix: Option<&str>,
        name: &str,
    ) -> Result<Option<LatestValue>, StorageError> {
        Ok(self.latest.get(&self.latest_key(prefix, name)).map(|v| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Granularity, TimeBucketer};
    use chrono::TimeZone;

    fn key(name: &str) -> BucketKey {
        let at = Utc.with_ymd_and_hms(2024, 3, 3, 12, 30, 0).unwrap();
        TimeBucketer::default().bucket_key(name, at, Granularity::Hour)
    }

    #[tokio::test]
    async fn test_inc_accumulates_per_key() {
        let driver = MemoryDriver::new();
        let values = Values::new().with("c", 1);

        driver.inc(&[key("a"), key("b")], &values).await.unwrap();
        driver.inc(&[key("a")], &values).await.unwrap();

        let got = driver.get(&[key("a"), key("b"), key("never")]).await.unwrap();
        assert_eq!(got[0], Values::new().with("c", 2));
        assert_eq!(got[1], Values::new().with("c", 1));
        assert!(got[2].is_empty());
        assert_eq!(driver.len(), 2);
        assert_eq!(driver.write_count(), 2);
    }

    #[tokio::test]
    async fn test_set_replaces_named_leaves() {
        let driver = MemoryDriver::new();
        driver
            .inc(&[key("g")], &Values::new().with("a", 1).with("b", 1))
            .await
            .unwrap();
        driver
            .set(&[key("g")], &Values::new().with("a", 10))
            .await
            .unwrap();

        let got = driver.get(&[key("g")]).await.unwrap();
        assert_eq!(got[0], Values::new().with("a", 10).with("b", 1));
    }

    #[tokio::test]
    async fn test_prefix_assigned_to_unprefixed_keys() {
        let driver = MemoryDriver::new().with_prefix("app");
        driver.inc(&[key("k")], &Values::new().with("c", 1)).await.unwrap();

        let expected = Identifier::Full(format!("app::k::1h::{}", key("k").epoch()));
        assert_eq!(driver.address(&key("k")).unwrap(), expected);
        assert!(driver.lookup(&expected).is_some());

        let explicit = key("k").with_prefix("own");
        assert_eq!(
            driver.address(&explicit).unwrap(),
            Identifier::Full(format!("own::k::1h::{}", key("k").epoch()))
        );
    }

    #[tokio::test]
    async fn test_separated_mode_without_separator() {
        let driver = MemoryDriver::with_mode(IdentifierMode::Separated, None);
        driver.inc(&[key("k")], &Values::new().with("c", 3)).await.unwrap();
        assert_eq!(driver.get(&[key("k")]).await.unwrap()[0].number("c"), Some(3.0));
    }

    #[tokio::test]
    async fn test_partial_mode_requires_separator() {
        let driver = MemoryDriver::with_mode(IdentifierMode::Partial, None);
        let err = driver
            .inc(&[key("k")], &Values::new().with("c", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingSeparator(IdentifierMode::Partial)));
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn test_inc_conflict_leaves_every_key_untouched() {
        let driver = MemoryDriver::new();
        driver
            .inc(&[key("tree")], &Values::new().with("c", Values::new().with("x", 1)))
            .await
            .unwrap();
        driver.inc(&[key("flat")], &Values::new().with("c", 1)).await.unwrap();

        // "fresh" would succeed alone; "tree" holds a map where a number arrives
        let err = driver
            .inc(&[key("fresh"), key("flat"), key("tree")], &Values::new().with("c", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidValue { .. }));

        assert_eq!(driver.len(), 2);
        assert_eq!(driver.write_count(), 2);
        let got = driver.get(&[key("fresh"), key("flat"), key("tree")]).await.unwrap();
        assert!(got[0].is_empty());
        assert_eq!(got[1], Values::new().with("c", 1));
        assert_eq!(got[2], Values::new().with("c", Values::new().with("x", 1)));
    }

    #[tokio::test]
    async fn test_ping_and_scan() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.scan(None, "cpu").await.unwrap(), None);

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        driver
            .ping(None, "cpu", at, &Values::new().with("load", 0.5))
            .await
            .unwrap();

        let latest = driver.scan(None, "cpu").await.unwrap().unwrap();
        assert_eq!(latest.at, at);
        assert_eq!(latest.values.number("load"), Some(0.5));
    }

    #[tokio::test]
    async fn test_latest_values_are_namespaced_by_prefix() {
        let driver = MemoryDriver::new().with_prefix("app");
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        driver.ping(None, "cpu", at, &Values::new().with("load", 0.1)).await.unwrap();
        driver
            .ping(Some("other"), "cpu", at, &Values::new().with("load", 0.9))
            .await
            .unwrap();

        // the driver prefix stands in for a missing one
        let own = driver.scan(Some("app"), "cpu").await.unwrap().unwrap();
        assert_eq!(own.values.number("load"), Some(0.1));
        assert_eq!(driver.scan(None, "cpu").await.unwrap(), Some(own));

        let other = driver.scan(Some("other"), "cpu").await.unwrap().unwrap();
        assert_eq!(other.values.number("load"), Some(0.9));
        assert_eq!(driver.scan(Some("missing"), "cpu").await.unwrap(), None);
    }
}
