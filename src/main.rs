//! LedgerScale - Rack-Aware Replicated Ledger Client
//!
//! Command line tool to inspect placement decisions for a statically
//! declared bookie cluster.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerscale::config::{validate_quorum, LedgerScaleConfig};
use ledgerscale::error::{Error, Result};
use ledgerscale::placement::{EnsemblePlacementPolicy, RackawarePlacementPolicy};
use ledgerscale::watcher::ClusterSnapshot;

/// LedgerScale - Rack-Aware Replicated Ledger Client
#[derive(Parser)]
#[command(name = "ledgerscale")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ledgerscale.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ledgerscale.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Place a new ensemble on the configured cluster
    Place {
        /// Ensemble size (defaults to [ledger].ensemble_size)
        #[arg(short, long)]
        ensemble: Option<usize>,

        /// Write quorum size (defaults to [ledger].write_quorum_size)
        #[arg(short, long)]
        write_quorum: Option<usize>,

        /// Bookies that must not be chosen
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<SocketAddr>,
    },

    /// Choose a replacement for one bookie
    Replace {
        /// Bookie to replace
        bookie: SocketAddr,

        /// Bookies that must not be chosen
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<SocketAddr>,
    },
}

#[derive(Serialize)]
struct PlacedBookie {
    position: usize,
    bookie: SocketAddr,
    rack: String,
}

#[derive(Serialize)]
struct Replacement {
    replaced: SocketAddr,
    replaced_rack: String,
    bookie: SocketAddr,
    rack: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None);
        return run_init(output);
    }

    let config = LedgerScaleConfig::from_file(&cli.config);
    match &config {
        Ok(config) => init_logging(
            cli.log_level.as_deref().unwrap_or(&config.logging.level),
            &config.logging.format,
            config.logging.file.as_deref(),
        ),
        Err(_) => init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None),
    }

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Validate => run_validate(&cli.config, config),
        Commands::Place {
            ensemble,
            write_quorum,
            exclude,
        } => run_place(config?, ensemble, write_quorum, exclude).await,
        Commands::Replace { bookie, exclude } => run_replace(config?, bookie, exclude).await,
    }
}

fn init_logging(level: &str, format: &str, file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match file.map(|path| (path, OpenOptions::new().create(true).append(true).open(path))) {
        Some((_, Ok(f))) => BoxMakeWriter::new(Mutex::new(f)),
        Some((path, Err(e))) => {
            eprintln!("Cannot open log file {}: {}, logging to stderr", path.display(), e);
            BoxMakeWriter::new(std::io::stderr)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
}

/// Write a sample configuration file
fn run_init(output: &Path) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let content = format!(
        "# LedgerScale Configuration\n# Generated configuration file\n\n{}",
        LedgerScaleConfig::sample()?
    );
    std::fs::write(output, content)?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

fn run_validate(path: &Path, config: Result<LedgerScaleConfig>) -> Result<()> {
    match config {
        Ok(config) => {
            println!("✓ Configuration is valid: {}", path.display());
            println!(
                "  Ledger quorum: e={} w={} a={}",
                config.ledger.ensemble_size,
                config.ledger.write_quorum_size,
                config.ledger.ack_quorum_size
            );
            println!(
                "  Bookies: {} writable, {} read-only",
                config.cluster.bookies.len(),
                config.cluster.read_only.len()
            );
            println!("  Rack mappings: {}", config.placement.racks.len());
            println!("  Available bookies path: {}", config.available_bookies_path());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Policy primed with the cluster declared in the configuration
async fn load_policy(config: &LedgerScaleConfig) -> RackawarePlacementPolicy {
    let policy = RackawarePlacementPolicy::from_config(config);
    let snapshot = ClusterSnapshot::from_config(&config.cluster);
    policy
        .on_cluster_changed(&snapshot.writable, &snapshot.read_only)
        .await;
    tracing::info!(
        "Loaded {} bookies in {} racks",
        snapshot.writable.len(),
        policy.num_racks().await
    );
    policy
}

async fn run_place(
    config: LedgerScaleConfig,
    ensemble: Option<usize>,
    write_quorum: Option<usize>,
    exclude: Vec<SocketAddr>,
) -> Result<()> {
    let ensemble_size = ensemble.unwrap_or(config.ledger.ensemble_size);
    let write_quorum_size = write_quorum.unwrap_or(config.ledger.write_quorum_size.min(ensemble_size));
    validate_quorum(ensemble_size, write_quorum_size, 1)?;

    let policy = load_policy(&config).await;
    let exclude: HashSet<SocketAddr> = exclude.into_iter().collect();
    let chosen = policy
        .new_ensemble(ensemble_size, write_quorum_size, &exclude)
        .await?;

    let mut placed = Vec::with_capacity(chosen.len());
    for (position, bookie) in chosen.into_iter().enumerate() {
        placed.push(PlacedBookie {
            position,
            bookie,
            rack: policy.location_of(bookie).await,
        });
    }
    print_json(&placed)
}

async fn run_replace(config: LedgerScaleConfig, bookie: SocketAddr, exclude: Vec<SocketAddr>) -> Result<()> {
    let policy = load_policy(&config).await;
    let exclude: HashSet<SocketAddr> = exclude.into_iter().collect();
    let replacement = policy.replace_bookie(bookie, &exclude).await?;

    print_json(&Replacement {
        replaced: bookie,
        replaced_rack: policy.location_of(bookie).await,
        bookie: replacement,
        rack: policy.location_of(replacement).await,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("failed to render output: {}", e)))?;
    println!("{}", out);
    Ok(())
}
