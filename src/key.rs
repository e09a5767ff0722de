//! Bucket keys and their storage identifiers
//!
//! A [`BucketKey`] names one bucket of one metric: `{prefix, name,
//! granularity, at}` where `at` is the canonical bucket start. Drivers project
//! it into the address shape their backend wants through an
//! [`IdentifierMode`]:
//!
//! ```text
//! Full       "p::k::1h::1700000000"                   key-value stores
//! Partial    { key: "p::k::1h", at: 1700000000 }      native timestamp columns
//! Separated  { name: "k", granularity: 1h, at: .. }   composite relational keys
//! ```
//!
//! The mode belongs to the driver, not the key, so it is always passed in.

use crate::error::StorageError;
use crate::time::Granularity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of one bucket of one metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    prefix: Option<String>,
    name: String,
    granularity: Granularity,
    at: DateTime<Utc>,
}

impl BucketKey {
    /// Create a key without truncating `at`
    ///
    /// The caller guarantees `at` is already a bucket start for
    /// `granularity`. Use [`TimeBucketer::bucket_key`] to build keys from
    /// arbitrary instants.
    ///
    /// [`TimeBucketer::bucket_key`]: crate::time::TimeBucketer::bucket_key
    pub fn new_unchecked(
        prefix: Option<String>,
        name: impl Into<String>,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            prefix,
            name: name.into(),
            granularity,
            at,
        }
    }

    /// Replace the key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the prefix unless one is already present
    ///
    /// Returns `true` when the prefix was assigned.
    pub fn assign_prefix(&mut self, prefix: &str) -> bool {
        if self.prefix.is_some() {
            return false;
        }
        self.prefix = Some(prefix.to_string());
        true
    }

    /// Optional namespace prefix
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Metric name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket size
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Bucket start
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Bucket start as Unix seconds
    pub fn epoch(&self) -> i64 {
        self.at.timestamp()
    }

    /// Project this key into a backend address
    ///
    /// `Full` and `Partial` join components with `separator` and fail with
    /// [`StorageError::MissingSeparator`] when it is `None`.
    pub fn identifier(
        &self,
        mode: IdentifierMode,
        separator: Option<&str>,
    ) -> Result<Identifier, StorageError> {
        match mode {
            IdentifierMode::Full => {
                let sep = separator.ok_or(StorageError::MissingSeparator(mode))?;
                let epoch = self.epoch().to_string();
                let mut parts = self.leading_parts();
                parts.push(&epoch);
                Ok(Identifier::Full(parts.join(sep)))
            },
            IdentifierMode::Partial => {
                let sep = separator.ok_or(StorageError::MissingSeparator(mode))?;
                Ok(Identifier::Partial {
                    key: self.leading_parts().join(sep),
                    at: self.at,
                })
            },
            IdentifierMode::Separated => Ok(Identifier::Separated {
                name: self.name.clone(),
                granularity: self.granularity,
                at: self.at,
            }),
        }
    }

    /// Stable text used to detect pending writes to the same bucket
    pub(crate) fn signature(&self) -> String {
        format!(
            "{},{},{},{}",
            self.prefix.as_deref().unwrap_or(""),
            self.name,
            self.granularity,
            self.epoch()
        )
    }

    fn leading_parts(&self) -> Vec<&str> {
        let mut parts = Vec::with_capacity(4);
        if let Some(prefix) = &self.prefix {
            parts.push(prefix.as_str());
        }
        parts.push(self.name.as_str());
        parts.push(self.granularity.as_str());
        parts
    }
}

/// How a driver addresses bucket keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierMode {
    /// One joined string including the epoch
    Full,
    /// Joined string without time, plus the bucket start
    Partial,
    /// Every component kept apart
    Separated,
}

impl FromStr for IdentifierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(IdentifierMode::Full),
            "partial" => Ok(IdentifierMode::Partial),
            "separated" => Ok(IdentifierMode::Separated),
            other => Err(format!("unknown identifier mode '{}'", other)),
        }
    }
}

/// A bucket key projected for a particular backend shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// `prefix⧺name⧺granularity⧺epoch`
    Full(String),
    /// `prefix⧺name⧺granularity` plus the bucket start
    Partial {
        /// Joined key without time
        key: String,
        /// Bucket start
        at: DateTime<Utc>,
    },
    /// Fully decomposed key
    Separated {
        /// Metric name
        name: String,
        /// Bucket size
        granularity: Granularity,
        /// Bucket start
        at: DateTime<Utc>,
    },
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Full(key) => f.write_str(key),
            Identifier::Partial { key, at } => write!(f, "{}@{}", key, at.timestamp()),
            Identifier::Separated {
                name,
                granularity,
                at,
            } => write!(f, "{}/{}@{}", name, granularity, at.timestamp()),
        }
    }
}
