//! Configuration management for kuba-tally
//!
//! TOML configuration files with environment variable overrides and
//! defaults that run without any file at all (in-memory storage, UTC,
//! buffering on).
//!
//! ```toml
//! [tracking]
//! granularities = ["1h", "1d", "1mo"]
//! timezone = "Europe/Berlin"
//! week_start = "monday"
//!
//! [buffer]
//! enabled = true
//! flush_interval_secs = 5
//! max_size = 100
//! aggregate = true
//!
//! [storage]
//! driver = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! ```

use crate::buffer::BufferConfig;
use crate::error::Error;
use crate::key::IdentifierMode;
use crate::time::{Granularity, TimeBucketer};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Bucketing configuration
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Write buffering
    #[serde(default)]
    pub buffer: BufferSettings,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Bucketing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    /// Granularity tokens each write is bucketed into, in order
    #[serde(default = "default_granularities")]
    pub granularities: Vec<String>,

    /// IANA timezone used for calendar boundaries
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// First day of the week
    #[serde(default = "default_week_start")]
    pub week_start: String,

    /// Key prefix for every bucket written
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Buffer section of the configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferSettings {
    /// Route writes through a buffer
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between timer flushes (0 disables the timer)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Pending actions that trigger a flush
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Merge writes to the same buckets
    #[serde(default)]
    pub aggregate: bool,

    /// Run the background flush timer
    #[serde(default = "default_true")]
    pub async_flush: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Driver kind: "memory" or "redis"
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Separator joining identifier components (empty for none)
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Identifier mode for the memory driver
    #[serde(default = "default_identifier_mode")]
    pub identifier_mode: IdentifierMode,

    /// Redis server URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis connection timeout in seconds
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level / `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Storage backend selected by [`StorageConfig::driver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// [`MemoryDriver`](crate::driver::MemoryDriver)
    Memory,
    /// [`RedisDriver`](crate::driver::RedisDriver)
    Redis,
}

// Default value functions
fn default_granularities() -> Vec<String> {
    vec!["1h".to_string(), "1d".to_string()]
}
fn default_timezone() -> String { "UTC".to_string() }
fn default_week_start() -> String { "monday".to_string() }
fn default_true() -> bool { true }
fn default_flush_interval_secs() -> u64 { crate::buffer::DEFAULT_FLUSH_INTERVAL.as_secs() }
fn default_max_size() -> usize { crate::buffer::DEFAULT_MAX_SIZE }
fn default_driver() -> String { "memory".to_string() }
fn default_separator() -> String { crate::driver::memory::DEFAULT_SEPARATOR.to_string() }
fn default_identifier_mode() -> IdentifierMode { IdentifierMode::Full }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_connection_timeout_secs() -> u64 { 5 }
fn default_log_level() -> String { "info".to_string() }

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            granularities: default_granularities(),
            timezone: default_timezone(),
            week_start: default_week_start(),
            prefix: None,
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: default_flush_interval_secs(),
            max_size: default_max_size(),
            aggregate: false,
            async_flush: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            separator: default_separator(),
            identifier_mode: default_identifier_mode(),
            redis_url: default_redis_url(),
            connection_timeout_secs: default_connection_timeout_secs(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl TrackingConfig {
    /// Parsed granularities, in configured order
    pub fn granularities(&self) -> Result<Vec<Granularity>, Error> {
        Granularity::parse_list(&self.granularities)
    }

    /// Parsed week start
    pub fn week_start(&self) -> Result<Weekday, Error> {
        self.week_start
            .parse::<Weekday>()
            .map_err(|_| Error::Configuration(format!("unknown week start '{}'", self.week_start)))
    }

    /// Bucketer for this timezone and week start
    ///
    /// An unknown timezone falls back to UTC with a warning.
    pub fn bucketer(&self) -> Result<TimeBucketer, Error> {
        Ok(TimeBucketer::new(&self.timezone, self.week_start()?))
    }
}

impl From<&BufferSettings> for BufferConfig {
    fn from(settings: &BufferSettings) -> Self {
        BufferConfig {
            flush_interval: Duration::from_secs(settings.flush_interval_secs),
            max_size: settings.max_size,
            aggregate: settings.aggregate,
            async_flush: settings.async_flush,
        }
    }
}

impl StorageConfig {
    /// Parsed driver kind
    pub fn kind(&self) -> Result<DriverKind, Error> {
        match self.driver.to_ascii_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "redis" => Ok(DriverKind::Redis),
            other => Err(Error::Configuration(format!("unknown storage driver '{}'", other))),
        }
    }

    /// Separator, or `None` when configured empty
    pub fn separator(&self) -> Option<&str> {
        Some(self.separator.as_str()).filter(|s| !s.is_empty())
    }

    /// Redis connection timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Tracking
        if let Ok(tz) = std::env::var("TALLY_TIMEZONE") {
            self.tracking.timezone = tz;
        }
        if let Ok(day) = std::env::var("TALLY_WEEK_START") {
            self.tracking.week_start = day;
        }
        if let Ok(list) = std::env::var("TALLY_GRANULARITIES") {
            self.tracking.granularities = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // Buffer
        if let Ok(enabled) = std::env::var("TALLY_BUFFER_ENABLED") {
            if let Ok(b) = enabled.parse() {
                self.buffer.enabled = b;
            }
        }
        if let Ok(secs) = std::env::var("TALLY_FLUSH_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                self.buffer.flush_interval_secs = s;
            }
        }
        if let Ok(size) = std::env::var("TALLY_BUFFER_SIZE") {
            if let Ok(s) = size.parse() {
                self.buffer.max_size = s;
            }
        }
        if let Ok(aggregate) = std::env::var("TALLY_BUFFER_AGGREGATE") {
            if let Ok(b) = aggregate.parse() {
                self.buffer.aggregate = b;
            }
        }

        // Storage
        if let Ok(driver) = std::env::var("TALLY_DRIVER") {
            self.storage.driver = driver;
        }
        if let Ok(url) = std::env::var("TALLY_REDIS_URL") {
            self.storage.redis_url = url;
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tracking.granularities.is_empty() {
            return Err("At least one granularity must be configured".to_string());
        }
        self.tracking.granularities().map_err(|e| e.to_string())?;
        self.tracking.week_start().map_err(|e| e.to_string())?;

        let kind = self.storage.kind().map_err(|e| e.to_string())?;
        if kind == DriverKind::Redis {
            if self.storage.redis_url.is_empty() {
                return Err("Redis URL cannot be empty".to_string());
            }
            if self.storage.separator().is_none() {
                return Err("Redis storage requires a separator".to_string());
            }
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}
