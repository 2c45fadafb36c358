//! tsdb-shipper CLI
//!
//! - `ls`: list the blocks of a local store
//! - `ship`: send a time range of a local store to a remote-write endpoint
//! - `config`: print a default configuration file

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsdb_shipper::config::{self, Config, LoggingConfig};
use tsdb_shipper::listing::{render_blocks, ListFormat};
use tsdb_shipper::ship::{LabelCollision, Shipper};
use tsdb_shipper::storage::{open_store, OpenMode, Store};

#[derive(Parser)]
#[command(name = "tsdb-shipper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ship historical data from a local TSDB to a remote-write endpoint")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (TOML); environment variables and flags override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List blocks of a store
    Ls {
        /// Store directory
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Print timestamps as dates
        #[arg(short = 'H', long)]
        human_readable: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Ship a time range to a remote-write endpoint
    Ship {
        /// Store directory
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Open the store writable and ship its head too
        #[arg(long)]
        write_mode: bool,
        /// With --write-mode, skip the store's LOCK file (e.g. left by a killed run)
        #[arg(long)]
        no_lockfile: bool,
        /// Remote-write URL
        #[arg(short, long)]
        url: Option<String>,
        /// Extra label added to every series, name=value (repeatable)
        #[arg(short = 'l', long = "external-label", value_parser = parse_label)]
        external_labels: Vec<(String, String)>,
        /// Lower bound, milliseconds since epoch
        #[arg(long, allow_hyphen_values = true)]
        min_time: Option<i64>,
        /// Upper bound, milliseconds since epoch (default: now)
        #[arg(long, allow_hyphen_values = true)]
        max_time: Option<i64>,
        /// Window width in seconds
        #[arg(long)]
        partition: Option<i64>,
        /// Concurrent senders
        #[arg(long)]
        concurrency: Option<usize>,
        /// Approximate encoded bytes per request
        #[arg(long)]
        max_batch_bytes: Option<usize>,
        /// Per-request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Handling of external labels that collide with series labels
        #[arg(long, value_enum)]
        label_collision: Option<LabelCollision>,
    },

    /// Print a default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    config::parse_external_label(s).map_err(|e| e.to_string())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tsdb_shipper={}", logging.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(Config::load_default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = config::generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Ls {
            path,
            human_readable,
            format,
        } => {
            if let Some(path) = path {
                config.source.dir = path.to_string_lossy().into_owned();
            }

            let store = open_store(&config.source.dir, OpenMode::ReadOnly)
                .with_context(|| format!("opening store {}", config.source.dir))?;
            let blocks = store.block_metas()?;
            print!("{}", render_blocks(&blocks, format, human_readable)?);
            if format == ListFormat::Json {
                println!();
            }
            store.close()?;
        }

        Commands::Ship {
            path,
            write_mode,
            no_lockfile,
            url,
            external_labels,
            min_time,
            max_time,
            partition,
            concurrency,
            max_batch_bytes,
            timeout,
            label_collision,
        } => {
            if let Some(path) = path {
                config.source.dir = path.to_string_lossy().into_owned();
            }
            config.source.write_mode |= write_mode;
            config.source.no_lockfile |= no_lockfile;
            if let Some(url) = url {
                config.remote.url = url;
            }
            if let Some(timeout) = timeout {
                config.remote.timeout_secs = timeout;
            }
            if min_time.is_some() {
                config.ship.min_time = min_time;
            }
            if max_time.is_some() {
                config.ship.max_time = max_time;
            }
            if let Some(partition) = partition {
                config.ship.partition_secs = partition;
            }
            if let Some(concurrency) = concurrency {
                config.ship.concurrency = concurrency;
            }
            if let Some(max_batch_bytes) = max_batch_bytes {
                config.ship.max_batch_bytes = max_batch_bytes;
            }
            if let Some(label_collision) = label_collision {
                config.ship.label_collision = label_collision;
            }

            let mut options = match config.ship_options() {
                Ok(options) => options,
                Err(e) => {
                    tracing::error!(stage = "configuration", error = %e);
                    return Err(e.into());
                }
            };
            // Flag order is kept; file labels follow, unless overridden by a flag
            if !external_labels.is_empty() {
                let from_file: Vec<_> = options
                    .external_labels
                    .into_iter()
                    .filter(|(name, _)| !external_labels.iter().any(|(n, _)| n == name))
                    .collect();
                let mut labels = external_labels;
                labels.extend(from_file);
                options.external_labels = labels;
            }

            let store: Arc<dyn Store> = match open_store(&config.source.dir, config.open_mode()) {
                Ok(store) => Arc::from(store),
                Err(e) => {
                    tracing::error!(stage = "open_store", path = %config.source.dir, error = %e);
                    return Err(e.into());
                }
            };

            let shipper = Shipper::new(Arc::clone(&store), options);
            let result = shipper.run().await;
            store.close()?;

            match result {
                Ok(report) => println!("{}", report),
                Err(e) => {
                    tracing::error!(stage = "ship", error = %e, "shipping failed");
                    return Err(e.into());
                }
            }
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}
