//! Kuba Tally command line
//!
//! Records and reads bucketed metrics against the configured storage driver.
//!
//! # CLI Commands
//!
//! - `check-config` - Validate configuration and print a summary
//! - `track <name> <json-values>` - Add values to every enabled bucket
//! - `set <name> <json-values>` - Overwrite values in every enabled bucket
//! - `query <name> <from> <to> --granularity <g>` - Print a bucketed series
//!
//! # Configuration
//!
//! Read from, in order:
//! 1. `--config <path>`
//! 2. `TALLY_CONFIG` environment variable
//! 3. `./tally.toml` in the current directory
//! 4. Default configuration
//!
//! `TALLY_*` environment variables override file values.

use chrono::Utc;
use clap::{Parser, Subcommand};
use kuba_tally::{
    config::Config,
    time::{parse_timestamp, Granularity},
    BufferRegistry, Error, Tally, Values,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_CONFIG_FILE: &str = "tally.toml";

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Calendar-bucketed metrics with buffered writes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides TALLY_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and print a summary
    CheckConfig,

    /// Add values to the buckets containing a timestamp
    Track {
        /// Metric name
        name: String,

        /// JSON object of numbers, nesting allowed (e.g. '{"hits":1}')
        values: String,

        /// RFC 3339 timestamp or epoch seconds (default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Overwrite values in the buckets containing a timestamp
    Set {
        /// Metric name
        name: String,

        /// JSON object of numbers, nesting allowed
        values: String,

        /// RFC 3339 timestamp or epoch seconds (default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Print the series between two timestamps
    Query {
        /// Metric name
        name: String,

        /// Range start (RFC 3339 or epoch seconds)
        from: String,

        /// Range end (RFC 3339 or epoch seconds)
        to: String,

        /// Bucket size (1m, 1h, 1d, 1w, 1mo, 1q, 1y)
        #[arg(short, long, default_value = "1h")]
        granularity: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

/// Resolve the configuration file and apply environment overrides
fn load_config(cli: &Cli) -> Result<Config, String> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("TALLY_CONFIG").map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        });

    match path {
        Some(path) => Config::from_file_with_env(&path.to_string_lossy()),
        None => Ok(Config::from_env()),
    }
}

fn parse_values(raw: &str) -> Result<Values, Error> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Serialization(format!("invalid values '{}': {}", raw, e)))
}

fn parse_at(raw: Option<&str>) -> Result<chrono::DateTime<Utc>, String> {
    match raw {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| format!("Invalid timestamp '{}'", raw)),
        None => Ok(Utc::now()),
    }
}

/// Validate configuration and print summary
fn cmd_check_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    println!("Configuration is valid!");
    println!();
    println!("Tracking:");
    println!("  Granularities: {}", config.tracking.granularities.join(", "));
    println!("  Timezone:      {}", config.tracking.timezone);
    println!("  Week start:    {}", config.tracking.week_start);
    if let Some(prefix) = &config.tracking.prefix {
        println!("  Prefix:        {}", prefix);
    }
    println!();
    println!("Buffer:");
    println!("  Enabled:       {}", config.buffer.enabled);
    println!("  Max size:      {}", config.buffer.max_size);
    println!("  Interval:      {}s", config.buffer.flush_interval_secs);
    println!("  Aggregate:     {}", config.buffer.aggregate);
    println!();
    println!("Storage:");
    println!("  Driver:        {}", config.storage.driver);
    println!("  Separator:     {:?}", config.storage.separator);

    Ok(())
}

async fn run(
    cli: &Cli,
    config: Config,
    registry: Arc<BufferRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let tally = Tally::from_config(config, Some(registry)).await?;

    match &cli.command {
        // Reported before the engine starts
        Commands::CheckConfig => {},
        Commands::Track { name, values, at } => {
            let values = parse_values(values)?;
            let at = parse_at(at.as_deref())?;
            tally.track(name, at, &values).await?;
            info!(name = %name, at = %at, "Tracked");
        },
        Commands::Set { name, values, at } => {
            let values = parse_values(values)?;
            let at = parse_at(at.as_deref())?;
            tally.set(name, at, &values).await?;
            info!(name = %name, at = %at, "Set");
        },
        Commands::Query {
            name,
            from,
            to,
            granularity,
            format,
        } => {
            let granularity: Granularity = granularity.parse()?;
            let series = tally.query_str(name, from, to, granularity).await?;
            debug!(points = series.len(), "Query complete");

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&series).map_err(Error::from)?);
            } else {
                for point in &series {
                    let values = serde_json::to_string(&point.values).map_err(Error::from)?;
                    println!("{}  {}", point.at.to_rfc3339(), values);
                }
            }
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::CheckConfig = cli.command {
        return cmd_check_config(&config);
    }

    let registry = BufferRegistry::new();
    registry.install_signal_handler()?;

    let result = run(&cli, config, registry.clone()).await;

    // Deliver anything still buffered before exit
    registry.flush_all().await;
    result
}
