//! Error types for the tally engine

use crate::key::IdentifierMode;
use crate::time::Granularity;
use thiserror::Error;

/// Main error type for the tally engine
#[derive(Error, Debug)]
pub enum Error {
    /// Storage driver error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No storage driver was configured before first use
    #[error("Storage driver not configured")]
    DriverNotConfigured,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Granularity token outside the known set
    #[error("Unknown granularity: {0}")]
    UnknownGranularity(String),

    /// Granularity is known but not tracked by this engine
    #[error("Granularity {0} is not enabled")]
    GranularityNotEnabled(Granularity),

    /// Input or output could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Storage driver errors
///
/// Returned by every [`StorageDriver`](crate::driver::StorageDriver) method,
/// including the buffering layer which forwards driver failures unchanged.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend rejected or failed the operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Connection to the backend failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Value tree has a shape that cannot be merged
    #[error("Invalid value at '{path}': {reason}")]
    InvalidValue {
        /// Dotted path of the offending leaf
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Identifier mode needs a separator but none was configured
    #[error("Identifier mode {0:?} requires a separator")]
    MissingSeparator(IdentifierMode),

    /// Driver does not implement the operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StorageError::Connection(e.to_string())
        } else {
            StorageError::Backend(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
