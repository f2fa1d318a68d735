#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `ferry`: pulls data from an HTTP API into `PostgreSQL` and `MongoDB`.
//!
//! Logging goes through [`ferry_cli_utils::init_logger`] so log lines and the
//! fetch progress bar never fight for the terminal.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use ferry_cli_utils::IndicatifProgress;
use ferry_storage::Storage;
use ferry_storage_models::TruncateRequest;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ferry", about = "Move API data into databases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured request and upsert the responses
    Upsert {
        /// Path to the TOML transport configuration
        #[arg(long)]
        config: PathBuf,
        /// Truncate every request table first, regardless of the config
        #[arg(long)]
        truncate: bool,
        /// Override the number of concurrent fetches
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List the tables (or collections) in a database
    Tables {
        /// Connection string (`postgresql://...` or `mongodb://...`)
        #[arg(long)]
        dns: String,
    },
    /// List the primary key columns of every table
    PrimaryKeys {
        /// Connection string (`postgresql://...` or `mongodb://...`)
        #[arg(long)]
        dns: String,
    },
    /// Delete every row from the given tables
    Truncate {
        /// Connection string (`postgresql://...` or `mongodb://...`)
        #[arg(long)]
        dns: String,
        /// Comma-separated table names, truncated in order
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = ferry_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Upsert {
            config,
            truncate,
            workers,
        } => {
            let mut config = ferry_transport::config::load_config(&config)?;
            config.truncate |= truncate;
            if let Some(workers) = workers {
                config.workers = workers;
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, rolling back");
                    on_signal.cancel();
                }
            });

            let start = Instant::now();
            let progress = IndicatifProgress::fetches_bar(&multi, "Connecting");
            let summary = ferry_transport::upsert(&config, progress, cancel).await?;

            log::info!(
                "Transport complete: {} fetches, {} bytes in {:.1}s",
                summary.fetches,
                summary.bytes,
                start.elapsed().as_secs_f64()
            );
            for storage in &summary.storages {
                println!(
                    "{:<10} upserted={} matched={} operations={} rotations={}",
                    storage.storage_type,
                    storage.txn.written.upserted_count,
                    storage.txn.written.matched_count,
                    storage.txn.operations,
                    storage.txn.rotations,
                );
            }
        }
        Commands::Tables { dns } => {
            let storage = ferry_storage::new(&dns).await?;
            let result = storage.list_tables().await;
            close(storage).await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Commands::PrimaryKeys { dns } => {
            let storage = ferry_storage::new(&dns).await?;
            let result = storage.list_primary_keys().await;
            close(storage).await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Commands::Truncate { dns, tables } => {
            let storage = ferry_storage::new(&dns).await?;
            let result = storage.truncate(&TruncateRequest::new(tables.iter())).await;
            close(storage).await;
            result?;
            log::info!("Truncated {}", tables.join(", "));
        }
    }

    Ok(())
}

async fn close(storage: Box<dyn Storage>) {
    let storage_type = storage.storage_type();
    if let Err(e) = storage.close().await {
        log::warn!("Failed to close {storage_type}: {e}");
    }
}
