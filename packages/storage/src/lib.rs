#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Storage backends for ferry.
//!
//! Every backend implements the [`Storage`] trait. [`new`] picks the
//! implementation from the connection string, so callers never name a
//! backend directly. Writes that must land atomically go through a
//! [`Txn`], which serializes operations onto a single background worker
//! and rotates the backend transaction when the backend imposes a maximum
//! transaction lifetime.

pub mod mongo;
pub mod postgres;
pub mod txn;
pub mod wire;

use async_trait::async_trait;
use ferry_storage_models::{
    ListPrimaryKeysResponse, ListTablesResponse, StorageType, TruncateRequest, TruncateResponse,
    UpsertRequest, UpsertResponse,
};
use tokio_util::sync::CancellationToken;

pub use txn::{Operation, Session, Txn, TxnSender, TxnSummary};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No backend matches the connection string.
    #[error("connection string is not supported: {dns}")]
    UnsupportedScheme {
        /// The rejected connection string.
        dns: String,
    },

    /// The storage is misconfigured (missing database name, table without
    /// a primary key, etc.).
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of what went wrong.
        message: String,
    },

    /// The initial client or connection could not be established.
    #[error("failed to connect to {storage_type}: {message}")]
    Connection {
        /// Backend that failed to connect.
        storage_type: StorageType,
        /// Underlying driver message.
        message: String,
    },

    /// `PostgreSQL` query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// `MongoDB` driver error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// A row returned by the backend could not be converted.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// The upsert payload could not be decoded into records.
    #[error("failed to decode records for table {table}: {message}")]
    Decode {
        /// Destination table of the rejected payload.
        table: String,
        /// Description of what went wrong.
        message: String,
    },

    /// Truncating one table failed; later tables were not touched.
    #[error("error truncating table {table}: {source}")]
    Truncate {
        /// Table that failed.
        table: String,
        /// Underlying failure.
        #[source]
        source: Box<Self>,
    },

    /// A queued operation failed and terminated its transaction.
    #[error("error in transaction: {0}")]
    Operation(#[source] Box<Self>),

    /// The transaction was rolled back, explicitly or because it was dropped
    /// without a commit.
    #[error("transaction aborted")]
    TransactionAborted,

    /// Committing or restarting the backend transaction at a lifetime
    /// boundary failed. Work applied before the boundary may already be
    /// durable, so the transaction cannot continue.
    #[error("failed to rotate transaction at lifetime boundary: {0}")]
    Rotation(#[source] Box<Self>),

    /// The transaction's cancellation token fired.
    #[error("transaction cancelled")]
    Cancelled,

    /// An operation was sent to a transaction that has already terminated.
    #[error("transaction is closed")]
    TransactionClosed,

    /// The transaction worker went away without reporting a result.
    #[error("transaction worker exited without reporting a result")]
    TransactionLost,
}

impl StorageError {
    pub(crate) fn connection(storage_type: StorageType, error: impl std::fmt::Display) -> Self {
        Self::Connection {
            storage_type,
            message: error.to_string(),
        }
    }
}

/// Capability set every storage backend implements.
///
/// Backends share no base implementation; each one is free to map these
/// operations onto its own driver however it needs to.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Disconnects from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend reports a failure while
    /// shutting down.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;

    /// Lists every table (or collection) in the connected database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend query fails.
    async fn list_tables(&self) -> Result<ListTablesResponse, StorageError>;

    /// Lists the primary key columns of every table, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend query fails.
    async fn list_primary_keys(&self) -> Result<ListPrimaryKeysResponse, StorageError>;

    /// Deletes every row from each table in `request`, in order.
    ///
    /// An empty request succeeds without contacting the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Truncate`] naming the first table that
    /// failed; later tables are left untouched.
    async fn truncate(&self, request: &TruncateRequest) -> Result<TruncateResponse, StorageError>;

    /// Inserts or updates the records decoded from `request` in one bulk
    /// operation.
    ///
    /// A payload with zero records succeeds with zero counts without
    /// contacting the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if any record fails to decode or the bulk
    /// write fails. No record is skipped silently.
    async fn upsert(&self, request: &UpsertRequest) -> Result<UpsertResponse, StorageError>;

    /// Starts a logical transaction backed by its own session.
    ///
    /// Cancelling `cancel` aborts the in-flight backend transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if a session cannot be opened.
    async fn start_tx(&self, cancel: CancellationToken) -> Result<Txn, StorageError>;

    /// Returns which backend this is.
    fn storage_type(&self) -> StorageType;
}

/// Resolves which backend a connection string selects.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedScheme`] if no backend scheme token
/// appears in `dns`.
pub fn storage_type_for(dns: &str) -> Result<StorageType, StorageError> {
    StorageType::from_connection_string(dns).ok_or_else(|| StorageError::UnsupportedScheme {
        dns: dns.to_string(),
    })
}

/// Connects to the backend selected by `dns`.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedScheme`] for unknown connection
/// strings and [`StorageError::Connection`] if the backend is unreachable.
pub async fn new(dns: &str) -> Result<Box<dyn Storage>, StorageError> {
    match storage_type_for(dns)? {
        StorageType::Mongo => Ok(Box::new(mongo::Mongo::connect(dns).await?)),
        StorageType::Postgres => Ok(Box::new(postgres::Postgres::connect(dns).await?)),
    }
}
