//! Logical transactions over rotating backend transactions.
//!
//! A [`Txn`] owns one background worker and one backend [`Session`].
//! Producers queue [`Operation`]s; the worker applies them strictly in
//! submission order. Backends with a maximum transaction lifetime (`MongoDB`
//! kills transactions older than 60 seconds) get their backend transaction
//! committed and restarted every `lifetime` without the caller noticing.
//!
//! The worker waits on, in priority order: cancellation, the lifetime
//! ticker, the commit/rollback decision, and the next operation. The
//! ticker is checked ahead of the queue on every iteration, so a queue that
//! is never empty cannot push a backend transaction past its lifetime.
//!
//! The first failing operation is latched. The queue is closed to new
//! sends, anything already queued is drained without being applied, the
//! backend transaction is aborted, and the [`Txn`] reports that first error.

use std::time::Duration;

use async_trait::async_trait;
use ferry_storage_models::{TruncateRequest, UpsertRequest, UpsertResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::StorageError;

/// A unit of work queued onto a [`Txn`].
///
/// The variant captures the intent; the backend [`Session`] supplies the
/// side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert or update a batch of records.
    Upsert(UpsertRequest),
    /// Delete every row from a set of tables.
    Truncate(TruncateRequest),
}

impl Operation {
    /// Short description used in log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Upsert(request) => {
                format!("upsert {} ({} bytes)", request.table, request.data.len())
            }
            Self::Truncate(request) => format!("truncate {}", request.tables.join(", ")),
        }
    }
}

/// What a committed [`Txn`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnSummary {
    /// Operations applied.
    pub operations: u64,
    /// Matched and upserted record counts summed over every operation.
    pub written: UpsertResponse,
    /// Times the backend transaction was committed and restarted at a
    /// lifetime boundary.
    pub rotations: u64,
}

impl TxnSummary {
    const fn record(&mut self, response: UpsertResponse) {
        self.operations += 1;
        self.written.merge(response);
    }
}

/// One backend session able to run a sequence of backend transactions.
///
/// Only the [`Txn`] worker drives a session, so implementations never see
/// concurrent calls.
#[async_trait]
pub trait Session: Send {
    /// Begins a new backend transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend refuses to start one.
    async fn begin(&mut self) -> Result<(), StorageError>;

    /// Commits the current backend transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the commit fails.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Aborts the current backend transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the abort fails.
    async fn abort(&mut self) -> Result<(), StorageError>;

    /// Applies one operation inside the current backend transaction.
    ///
    /// Truncates report zero counts.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the operation fails.
    async fn apply(&mut self, operation: &Operation) -> Result<UpsertResponse, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Rollback,
}

/// Cloneable handle for queueing operations onto a [`Txn`] from several
/// producers.
#[derive(Debug, Clone)]
pub struct TxnSender {
    ops: mpsc::UnboundedSender<Operation>,
}

impl TxnSender {
    /// Queues an operation. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TransactionClosed`] if the transaction has
    /// already terminated or stopped accepting work.
    pub fn send(&self, operation: Operation) -> Result<(), StorageError> {
        self.ops
            .send(operation)
            .map_err(|_| StorageError::TransactionClosed)
    }

    /// Returns `true` once the transaction no longer accepts operations.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.ops.is_closed()
    }
}

/// A logical transaction spanning one or more backend transactions.
///
/// Dropping a `Txn` without calling [`Txn::commit`] rolls it back.
#[derive(Debug)]
pub struct Txn {
    sender: TxnSender,
    decision: oneshot::Sender<Decision>,
    done: oneshot::Receiver<Result<TxnSummary, StorageError>>,
}

impl Txn {
    /// Spawns the worker for `session` and returns the caller's handle.
    ///
    /// When `lifetime` is set the backend transaction is rotated every
    /// `lifetime`. Must be called from within a tokio runtime.
    pub fn start(
        session: impl Session + 'static,
        lifetime: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let worker = Worker {
            session: Box::new(session),
            ops: ops_rx,
            decision: decision_rx,
            lifetime,
            cancel,
        };

        tokio::spawn(async move {
            let result = worker.run().await;
            if let Err(e) = &result {
                log::debug!("Transaction worker finished: {e}");
            }
            // The caller may have dropped the Txn; nobody is left to tell.
            done_tx.send(result).ok();
        });

        Self {
            sender: TxnSender { ops: ops_tx },
            decision: decision_tx,
            done: done_rx,
        }
    }

    /// Queues an operation. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TransactionClosed`] if the transaction has
    /// already terminated.
    pub fn send(&self, operation: Operation) -> Result<(), StorageError> {
        self.sender.send(operation)
    }

    /// Returns an additional producer handle.
    #[must_use]
    pub fn sender(&self) -> TxnSender {
        self.sender.clone()
    }

    /// Returns `true` once the worker has stopped accepting operations.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.sender.is_terminated()
    }

    /// Applies everything queued so far, commits, and waits for the worker.
    ///
    /// Operations sent through other [`TxnSender`]s after this call are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns the worker's terminal error: the first failed operation
    /// ([`StorageError::Operation`]), a failed rotation
    /// ([`StorageError::Rotation`]), cancellation, or a commit failure.
    pub async fn commit(self) -> Result<TxnSummary, StorageError> {
        self.finish(Decision::Commit).await
    }

    /// Aborts the transaction and waits for the worker.
    ///
    /// # Errors
    ///
    /// Returns the worker's terminal error if it failed for a reason other
    /// than the requested rollback.
    pub async fn rollback(self) -> Result<(), StorageError> {
        match self.finish(Decision::Rollback).await {
            Ok(_) | Err(StorageError::TransactionAborted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn finish(self, decision: Decision) -> Result<TxnSummary, StorageError> {
        let Self {
            sender,
            decision: decision_tx,
            done,
        } = self;
        drop(sender);

        // If the worker already terminated, its own result wins.
        decision_tx.send(decision).ok();

        done.await.unwrap_or(Err(StorageError::TransactionLost))
    }
}

struct Worker {
    session: Box<dyn Session>,
    ops: mpsc::UnboundedReceiver<Operation>,
    decision: oneshot::Receiver<Decision>,
    lifetime: Option<Duration>,
    cancel: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_lines)]
    async fn run(self) -> Result<TxnSummary, StorageError> {
        let Self {
            mut session,
            mut ops,
            decision: mut decision_rx,
            lifetime,
            cancel,
        } = self;

        if let Err(e) = session.begin().await {
            ops.close();
            return Err(e);
        }

        let mut ticker = lifetime.map(|lifetime| {
            let mut ticker = tokio::time::interval_at(Instant::now() + lifetime, lifetime);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut summary = TxnSummary::default();
        let mut failure: Option<StorageError> = None;
        let mut decision: Option<Decision> = None;
        let mut ops_open = true;

        while ops_open || (decision.is_none() && failure.is_none()) {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    ops.close();
                    abort_quietly(session.as_mut()).await;
                    return Err(StorageError::Cancelled);
                }

                () = tick(&mut ticker), if failure.is_none() => {
                    log::debug!("Transaction lifetime reached, rotating");
                    if let Err(e) = rotate(session.as_mut()).await {
                        log::error!("Failed to rotate transaction: {e}");
                        ops.close();
                        abort_quietly(session.as_mut()).await;
                        return Err(StorageError::Rotation(Box::new(e)));
                    }
                    if let Some(ticker) = ticker.as_mut() {
                        ticker.reset();
                    }
                    summary.rotations += 1;
                }

                received = &mut decision_rx, if decision.is_none() => {
                    // A dropped Txn counts as a rollback.
                    decision = Some(received.unwrap_or(Decision::Rollback));
                    ops.close();
                }

                operation = ops.recv(), if ops_open => {
                    let Some(operation) = operation else {
                        ops_open = false;
                        continue;
                    };
                    if failure.is_some() || decision == Some(Decision::Rollback) {
                        continue;
                    }
                    match session.apply(&operation).await {
                        Ok(response) => summary.record(response),
                        Err(e) => {
                            log::error!("Operation failed ({}): {e}", operation.describe());
                            failure = Some(e);
                            ops.close();
                        }
                    }
                }
            }
        }

        if let Some(e) = failure {
            abort_quietly(session.as_mut()).await;
            return Err(StorageError::Operation(Box::new(e)));
        }

        match decision {
            Some(Decision::Commit) => {
                session.commit().await?;
                log::debug!(
                    "Transaction committed: {} operations, {} rotations",
                    summary.operations,
                    summary.rotations
                );
                Ok(summary)
            }
            Some(Decision::Rollback) | None => {
                session.abort().await?;
                Err(StorageError::TransactionAborted)
            }
        }
    }
}

/// Resolves on the next lifetime tick, or never when there is no lifetime.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn rotate(session: &mut dyn Session) -> Result<(), StorageError> {
    session.commit().await?;
    session.begin().await
}

async fn abort_quietly(session: &mut dyn Session) {
    if let Err(e) = session.abort().await {
        log::warn!("Failed to abort transaction: {e}");
    }
}
