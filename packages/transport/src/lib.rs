#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Moves data from an HTTP API into one or more storages.
//!
//! [`upsert`] flattens every configured request, fetches the resulting
//! units concurrently, and queues each response body as an upsert on one
//! [`Txn`] per storage. Every storage commits only after all fetches have
//! succeeded; any failure rolls all of them back.

pub mod config;
pub mod flatten;
pub mod log_format;
pub mod progress;

use std::sync::Arc;

use ferry_storage::{Operation, Storage, StorageError, Txn, TxnSummary};
use ferry_storage_models::{StorageType, TruncateRequest, UpsertRequest};
use ferry_transport_models::Config;
use ferry_web::{Client, WebError};
use futures::stream::{self, StreamExt as _};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::flatten::{FlattenedRequest, flatten_timeseries};
use crate::log_format::WorkerLog;
use crate::progress::ProgressCallback;

/// Errors that can occur while running a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A request endpoint cannot be turned into a URL.
    #[error("malformed request {endpoint}: {message}")]
    MalformedRequest {
        /// Endpoint as configured.
        endpoint: String,
        /// Description of what went wrong.
        message: String,
    },

    /// A time-series request has no rate limit of its own and there is no
    /// default.
    #[error("request {endpoint} has a time series but no rate limit")]
    MissingRateLimit {
        /// Endpoint as configured.
        endpoint: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// Storage or transaction failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// HTTP failure.
    #[error(transparent)]
    Web(#[from] WebError),

    /// TOML parsing failed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error (file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What one storage committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSummary {
    /// Backend written to.
    pub storage_type: StorageType,
    /// Counts reported by its transaction.
    pub txn: TxnSummary,
}

/// Result of a successful [`upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Completed fetches.
    pub fetches: u64,
    /// Response bytes received.
    pub bytes: u64,
    /// One entry per connection string, in configuration order.
    pub storages: Vec<StorageSummary>,
}

/// Runs every request in `config` and writes the responses to every
/// configured storage.
///
/// Requests are flattened before anything connects, so a malformed
/// configuration fails without side effects. With `truncate` set, each
/// storage's transaction starts by truncating every request table.
///
/// # Errors
///
/// Returns the first flattening, connection, fetch or storage error. All
/// transactions are rolled back when any step fails.
pub async fn upsert(
    config: &Config,
    progress: Arc<dyn ProgressCallback>,
    cancel: CancellationToken,
) -> Result<UpsertSummary, TransportError> {
    config::validate(config)?;

    let client = Arc::new(Client::new(config.user_agent.as_deref(), &config.headers)?);
    let flattened = flatten_all(config, &client)?;
    log::info!(
        "Flattened {} requests into {} fetches",
        config.requests.len(),
        flattened.len()
    );

    let storages = connect_all(&config.connection_strings).await?;
    let result = run(config, flattened, &storages, progress, &cancel).await;
    close_all(storages).await;
    result
}

/// Flattens every request, in configuration order.
fn flatten_all(
    config: &Config,
    client: &Arc<Client>,
) -> Result<Vec<FlattenedRequest>, TransportError> {
    let mut flattened = Vec::new();
    for request in &config.requests {
        flattened.extend(flatten_timeseries(
            request,
            &config.url,
            client,
            config.rate_limit.as_ref(),
        )?);
    }
    Ok(flattened)
}

async fn connect_all(dns_list: &[String]) -> Result<Vec<Box<dyn Storage>>, TransportError> {
    let mut storages = Vec::with_capacity(dns_list.len());
    for dns in dns_list {
        match ferry_storage::new(dns).await {
            Ok(storage) => {
                log::info!("Connected to {}", storage.storage_type());
                storages.push(storage);
            }
            Err(e) => {
                close_all(storages).await;
                return Err(e.into());
            }
        }
    }
    Ok(storages)
}

async fn close_all(storages: Vec<Box<dyn Storage>>) {
    for storage in storages {
        let storage_type = storage.storage_type();
        if let Err(e) = storage.close().await {
            log::warn!("Failed to close {storage_type}: {e}");
        }
    }
}

async fn run(
    config: &Config,
    flattened: Vec<FlattenedRequest>,
    storages: &[Box<dyn Storage>],
    progress: Arc<dyn ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<UpsertSummary, TransportError> {
    let mut txns = Vec::with_capacity(storages.len());
    for storage in storages {
        match storage.start_tx(cancel.child_token()).await {
            Ok(txn) => txns.push((storage.storage_type(), txn)),
            Err(e) => {
                rollback_all(txns).await;
                return Err(e.into());
            }
        }
    }

    match feed(config, flattened, &txns, progress.as_ref(), cancel).await {
        Ok((fetches, bytes)) => {
            let storages = commit_all(txns).await?;
            progress.finish(format!("{fetches} fetches, {bytes} bytes"));
            Ok(UpsertSummary {
                fetches,
                bytes,
                storages,
            })
        }
        Err(e) => {
            let cause = rollback_all(txns).await;
            // A closed transaction only means a worker already failed;
            // report why.
            match (e, cause) {
                (TransportError::Storage(StorageError::TransactionClosed), Some(cause)) => {
                    Err(cause.into())
                }
                (e, _) => Err(e),
            }
        }
    }
}

/// Queues the optional truncate, then fetches everything and queues each
/// stored response on every transaction.
async fn feed(
    config: &Config,
    flattened: Vec<FlattenedRequest>,
    txns: &[(StorageType, Txn)],
    progress: &dyn ProgressCallback,
    cancel: &CancellationToken,
) -> Result<(u64, u64), TransportError> {
    if config.truncate {
        let tables = request_tables(config);
        if !tables.is_empty() {
            log::info!("Truncating {}", tables.join(", "));
            for (_, txn) in txns {
                txn.send(Operation::Truncate(TruncateRequest::new(tables.clone())))?;
            }
        }
    }

    progress.set_total(flattened.len() as u64);
    progress.set_message("Fetching".to_string());

    let mut fetches = stream::iter(flattened.into_iter().enumerate().map(|(i, flat)| async move {
        let started = Instant::now();
        let body = ferry_web::fetch(&flat.fetch_config).await;
        (i + 1, flat.table, started.elapsed(), body)
    }))
    .buffer_unordered(config.workers.max(1));

    let mut completed = 0u64;
    let mut bytes = 0u64;
    loop {
        // In-flight fetches may be sleeping on backoff or the rate limiter.
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StorageError::Cancelled.into()),
            next = fetches.next() => next,
        };
        let Some((id, table, elapsed, body)) = next else {
            break;
        };
        let body = body?;
        let len = body.len();
        bytes += len as u64;

        if let Some(table) = table {
            log::info!(
                "{}",
                WorkerLog::new(id, elapsed, format!("fetched {len} bytes for {table}"))
            );
            let request = UpsertRequest::new(table, body);
            for (_, txn) in txns {
                txn.send(Operation::Upsert(request.clone()))?;
            }
        } else {
            log::info!(
                "{}",
                WorkerLog::new(id, elapsed, format!("fetched {len} bytes, not stored"))
            );
        }

        completed += 1;
        progress.inc(1);
    }

    Ok((completed, bytes))
}

/// Distinct request tables in configuration order.
fn request_tables(config: &Config) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for table in config.requests.iter().filter_map(|r| r.table.as_ref()) {
        if !tables.contains(table) {
            tables.push(table.clone());
        }
    }
    tables
}

/// Commits every transaction in order. After the first failure the rest
/// are rolled back.
async fn commit_all(
    txns: Vec<(StorageType, Txn)>,
) -> Result<Vec<StorageSummary>, TransportError> {
    let mut summaries = Vec::with_capacity(txns.len());
    let mut remaining = txns.into_iter();

    for (storage_type, txn) in remaining.by_ref() {
        match txn.commit().await {
            Ok(summary) => {
                log::info!(
                    "Committed {storage_type}: {} operations, {} upserted, {} matched, {} rotations",
                    summary.operations,
                    summary.written.upserted_count,
                    summary.written.matched_count,
                    summary.rotations,
                );
                summaries.push(StorageSummary {
                    storage_type,
                    txn: summary,
                });
            }
            Err(e) => {
                log::error!("Commit failed for {storage_type}: {e}");
                rollback_all(remaining.collect()).await;
                return Err(e.into());
            }
        }
    }

    Ok(summaries)
}

/// Rolls back every transaction and returns the first failure a worker
/// reported on its own.
async fn rollback_all(txns: Vec<(StorageType, Txn)>) -> Option<StorageError> {
    let mut first = None;
    for (storage_type, txn) in txns {
        if let Err(e) = txn.rollback().await {
            log::error!("Transaction on {storage_type} failed: {e}");
            first.get_or_insert(e);
        }
    }
    first
}
