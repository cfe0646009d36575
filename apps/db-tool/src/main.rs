//! Inspection tool for persisted data directories.
//!
//! Provides commands for:
//! - Listing databases and their versions
//! - Usage estimates per database or for the whole directory
//! - Dumping the records of one object store as JSON lines

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use objectdb_core::config::DbConfig;
use objectdb_core::database::Snapshot;
use objectdb_core::persistence::PersistenceManager;
use objectdb_core::usage::{EstimateScope, StorageEstimate, UsageAccountant};

/// Command-line arguments for the inspection tool.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory to inspect
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List databases and their versions
    List,
    /// Print a usage estimate
    Estimate {
        /// Restrict the estimate to one database
        #[arg(long)]
        database: Option<String>,
    },
    /// Print the records of an object store as JSON lines
    Dump {
        /// Database name
        name: String,
        /// Object store name
        store: String,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    if !args.data_dir.is_dir() {
        bail!("data directory {} does not exist", args.data_dir.display());
    }
    let config = DbConfig::persistent(&args.data_dir);
    let persistence = PersistenceManager::open(args.data_dir.clone(), &config)
        .with_context(|| format!("failed to open {}", args.data_dir.display()))?;
    let databases = persistence
        .load_all()
        .context("failed to load persisted databases")?;
    tracing::debug!(
        "Loaded {} database(s) from {}",
        databases.len(),
        args.data_dir.display()
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Command::List => {
            for (name, snapshot) in &databases {
                writeln!(
                    out,
                    "{}\tversion {}\t{} store(s)",
                    name,
                    snapshot.version,
                    snapshot.stores.len()
                )?;
            }
        }
        Command::Estimate { database } => {
            let estimate = estimate(&config, &databases, database)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&estimate)?)?;
        }
        Command::Dump { name, store, limit } => {
            let snapshot = databases
                .iter()
                .find(|(db, _)| *db == name)
                .map(|(_, snapshot)| snapshot)
                .with_context(|| format!("database '{}' not found", name))?;
            let data = snapshot.store(&store)?;
            for (key, record) in data.records.iter().take(limit.unwrap_or(usize::MAX)) {
                let line = serde_json::json!({ "key": key, "value": &*record.value });
                writeln!(out, "{}", line)?;
            }
        }
    }
    Ok(())
}

/// Rebuilds usage records the way the engine does on startup.
fn estimate(
    config: &DbConfig,
    databases: &[(String, Snapshot)],
    database: Option<String>,
) -> anyhow::Result<StorageEstimate> {
    let mut accountant = UsageAccountant::new(config);
    for (name, snapshot) in databases {
        let record = accountant.measure(name, snapshot);
        accountant.apply(record);
    }
    let scope = match database {
        Some(name) => {
            if accountant.record(&name).is_none() {
                bail!("database '{}' not found", name);
            }
            EstimateScope::Database(name)
        }
        None => EstimateScope::Origin,
    };
    Ok(accountant.estimate(&scope))
}
