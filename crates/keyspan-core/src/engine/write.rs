//! Write/transaction engine: single conditional writes and multi-item
//! atomic transactions with bounded conflict retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, warn};

use super::{Backoff, MAX_ATTEMPTS, surface_backend_error};
use crate::backend::{PartitionBackend, TransactError, WriteAction, WriteError};
use crate::error::{CommitError, ConditionFailure, Error};
use crate::types::TxnId;

/// An ordered list of write actions submitted as one atomic unit.
///
/// The id is an idempotency token for logging and tracing, not for dedup.
pub struct Transaction {
    pub id: TxnId,
    pub actions: Vec<WriteAction>,
}

/// Executes writes against the backend, classifies failures, and retries
/// transient conflicts.
pub struct WriteEngine<B> {
    backend: Arc<B>,
    txn_counter: AtomicU64,
}

impl<B: PartitionBackend> WriteEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        WriteEngine {
            backend,
            txn_counter: AtomicU64::new(0),
        }
    }

    /// Wrap actions in a transaction with a fresh id.
    pub fn begin(&self, actions: Vec<WriteAction>) -> Transaction {
        Transaction {
            id: self.txn_counter.fetch_add(1, Ordering::Relaxed) + 1,
            actions,
        }
    }

    /// Execute one conditional write. A condition failure is surfaced typed
    /// and never retried.
    pub fn store(&self, action: &WriteAction) -> Result<(), Error> {
        match self.backend.write(action) {
            Ok(()) => Ok(()),
            Err(WriteError::ConditionFailed) => {
                let kind = action
                    .condition()
                    .map_or(ConditionFailure::Custom, |c| c.failure_kind());
                Err(CommitError::ConditionFailed(kind).into())
            }
            Err(WriteError::Backend(e)) => Err(surface_backend_error(e)),
        }
    }

    /// Submit a multi-item transaction, retrying pure write-write conflicts
    /// with capped-exponential backoff.
    ///
    /// Abort classification, in order: any action failed its precondition
    /// means the caller lost the race and the whole transaction aborts
    /// typed and non-retryable; otherwise at least one conflict with a
    /// concurrent transaction means sleep and resubmit unchanged; anything
    /// else is fatal. After the attempt budget the last conflict is
    /// surfaced as a transient failure.
    pub fn commit(&self, txn: &Transaction) -> Result<(), Error> {
        let mut backoff = Backoff::new();
        let mut last_conflict = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.backend.transact(&txn.actions) {
                Ok(()) => return Ok(()),
                Err(TransactError::Canceled(abort)) => {
                    if let Some(index) = abort.first_condition_failure() {
                        let kind = txn.actions[index]
                            .condition()
                            .map_or(ConditionFailure::Custom, |c| c.failure_kind());
                        return Err(CommitError::ConditionFailed(kind).into());
                    }
                    if abort.any_conflict() {
                        last_conflict = abort.describe();
                        warn!(
                            txn = txn.id,
                            attempt,
                            conflict = %last_conflict,
                            "transaction conflict, retrying"
                        );
                        if attempt < MAX_ATTEMPTS {
                            backoff.sleep();
                        }
                        continue;
                    }
                    return Err(CommitError::TransactionFailed(abort.describe()).into());
                }
                Err(TransactError::Backend(e)) => return Err(surface_backend_error(e)),
            }
        }

        error!(txn = txn.id, attempts = MAX_ATTEMPTS, "transaction conflict budget exhausted");
        Err(CommitError::Transient {
            attempts: MAX_ATTEMPTS,
            cause: last_conflict,
        }
        .into())
    }
}
