use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use ruta::config::{Config, ConfigError, GroupMode};
use ruta::core::partition::validate_effective_partition_key;
use ruta::core::{KeySpace, PartitionKey};
use ruta::utils::{format_duration, format_request_units};
use ruta::{CollectionRoutingMap, PartitionKeyRangeCache};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ruta")]
#[command(about = "Partition-aware request routing, retry and throughput control for partitioned document stores")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Ruta Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve partition keys against the configured partition layout
    Resolve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// Partition key to resolve (repeatable)
        #[arg(short, long = "key")]
        keys: Vec<String>,
        /// Effective partition key, in hex, to resolve (repeatable)
        #[arg(short, long = "epk")]
        epks: Vec<String>,
    },
    /// Generate example configuration files
    Config {
        /// Throughput control profile (local or global)
        #[arg(short, long)]
        profile: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve { config, keys, epks } => {
            resolve_keys(config, keys, epks).await?;
        }
        Commands::Config { profile, output } => {
            generate_config(profile, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn resolve_keys(config_path: PathBuf, keys: Vec<String>, epks: Vec<String>) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);

    let source = config.metadata_source().context("No partition layout to resolve against")?;
    let cache = PartitionKeyRangeCache::new(Arc::new(source));
    let map = cache
        .try_lookup(&config.client.collection)
        .await
        .context("Failed to build routing map")?;

    println!(
        "Collection {}: {} partition key ranges",
        map.collection_unique_id(),
        map.len()
    );

    if keys.is_empty() && epks.is_empty() {
        for range in map.ordered_partition_key_ranges() {
            print!("  ");
            print_owner(&map, &range.id);
        }
        return Ok(());
    }

    for key in &keys {
        let epk = PartitionKey::new(key.as_str()).effective_partition_key();
        let range = map.range_by_effective_partition_key(&epk)?;
        print!("  {:?} -> {} -> ", key, epk);
        print_owner(&map, &range.id);
    }

    for epk in &epks {
        validate_effective_partition_key(epk, &KeySpace::default())?;
        let range = map.range_by_effective_partition_key(epk)?;
        print!("  {} -> ", epk);
        print_owner(&map, &range.id);
    }

    Ok(())
}

fn print_owner(map: &CollectionRoutingMap, range_id: &str) {
    match (map.try_range_by_partition_key_range_id(range_id), map.owner_of(range_id)) {
        (Some(range), Some(owner)) => println!("{} owned by {}", range, owner),
        _ => println!("{} (unknown)", range_id),
    }
}

fn generate_config(profile: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", profile, output);

    Config::create_example_config(&output, &profile).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  ruta resolve --config {:?} --key <partition key>", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            bail!(e);
        }
    };

    println!("✓ Configuration file is valid");
    println!("  Collection: {}", config.client.collection);
    println!(
        "  Endpoint discovery: {}",
        if config.client.enable_endpoint_discovery { "enabled" } else { "disabled" }
    );

    let endpoints = config.endpoint_manager().endpoints();
    println!("  Regional endpoints: {} (in preference order)", endpoints.len());
    for (i, endpoint) in endpoints.iter().enumerate() {
        println!("    {}: {}", i + 1, endpoint);
    }

    let retry = config.retry_options();
    println!(
        "  Throttle retries: {} attempts within {}",
        retry.max_throttle_retry_attempts,
        format_duration(retry.max_throttle_wait)
    );
    println!(
        "  Session read retries: {} attempts, backoff {} to {}",
        retry.max_session_read_retry_attempts,
        format_duration(retry.session_read_initial_backoff),
        format_duration(retry.session_read_max_backoff)
    );

    println!("  Throughput groups: {}", config.throughput.groups.len());
    for group in config.throughput_groups()? {
        let budget = group.target.resolve(config.throughput.container_throughput);
        println!(
            "    {}: {} ({}/s){}",
            group.name,
            group.target,
            format_request_units(budget),
            if group.is_default { " [default]" } else { "" }
        );
    }
    let global = config
        .throughput
        .groups
        .iter()
        .filter(|g| g.mode == GroupMode::Global)
        .count();
    if global > 0 {
        println!("  Global groups need a shared budget store: {}", global);
    }

    match config.refresh_interval() {
        Some(interval) => println!("  Routing refresh interval: {}", format_duration(interval)),
        None => println!("  Routing refresh: disabled"),
    }
    println!("  Static partitions: {}", config.routing.partitions.len());

    Ok(())
}

fn show_version() {
    println!("ruta v{}", env!("CARGO_PKG_VERSION"));
    println!("Partition-aware request routing for partitioned document stores");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Immutable routing snapshots with incremental split/merge refresh");
    println!("  • Retry policies for throttling, session reads, failover and stale routing");
    println!("  • Local and globally coordinated throughput control groups");
    println!("  • Session token tracking across partition splits");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    match config.logging.format.as_str() {
        "structured" => {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            let log_level = match config.logging.level.as_str() {
                "trace" => log::LevelFilter::Trace,
                "debug" => log::LevelFilter::Debug,
                "info" => log::LevelFilter::Info,
                "warn" => log::LevelFilter::Warn,
                "error" => log::LevelFilter::Error,
                _ => log::LevelFilter::Info,
            };

            env_logger::Builder::from_default_env()
                .filter_level(log_level)
                .try_init()
                .context("Failed to initialize logging")?;
        }
    }

    info!("Logging initialized ({} format, level {})", config.logging.format, config.logging.level);
    Ok(())
}
