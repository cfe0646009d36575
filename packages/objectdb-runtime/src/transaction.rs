//! Transaction handles.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use objectdb_core::error::DbError;
use objectdb_core::transaction::{TransactionMode, TransactionState};

use crate::database::Database;
use crate::engine::TxnShared;
use crate::object_store::ObjectStore;
use crate::request::{Operation, Request};
use crate::Result;

/// Handle to a transaction.
///
/// The transaction is active while its creator keeps issuing requests,
/// inactive between ticks, and commits on its own once inactive with an
/// empty queue unless `commit()` or `abort()` is called first.
#[derive(Clone)]
pub struct Transaction {
    database: Database,
    id: u64,
    mode: TransactionMode,
    scope: Arc<BTreeSet<String>>,
    shared: Arc<TxnShared>,
}

impl Transaction {
    pub(crate) fn new(
        database: Database,
        id: u64,
        mode: TransactionMode,
        scope: BTreeSet<String>,
        shared: Arc<TxnShared>,
    ) -> Self {
        Self {
            database,
            id,
            mode,
            scope: Arc::new(scope),
            shared,
        }
    }

    /// Engine-unique transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Declared mode.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Declared scope (empty for version changes).
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Connection the transaction was created on.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        let state = self.database.engine().lock();
        if let Some(entry) = state.txns.get(&self.id) {
            return entry.txn.state();
        }
        match self.shared.outcome() {
            Some(Ok(())) => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }

    /// Error that aborted the transaction, if any.
    pub fn error(&self) -> Option<DbError> {
        {
            let state = self.database.engine().lock();
            if let Some(entry) = state.txns.get(&self.id) {
                return entry.txn.error().cloned();
            }
        }
        self.shared.outcome().and_then(|o| o.err())
    }

    /// Store names the transaction can open.
    pub fn object_store_names(&self) -> Vec<String> {
        let state = self.database.engine().lock();
        match state.txns.get(&self.id) {
            Some(entry) => entry.txn.store_names(),
            None => self.scope.iter().cloned().collect(),
        }
    }

    /// Returns a handle to a store in scope.
    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        let state = self.database.engine().lock();
        let entry = state.txns.get(&self.id).ok_or_else(|| self.finished())?;
        if entry.txn.state().is_terminal() {
            return Err(self.finished());
        }
        if !entry.txn.store_names().iter().any(|s| s == name) {
            return Err(DbError::NotFound {
                store: name.to_string(),
            });
        }
        Ok(ObjectStore::new(self.clone(), name.to_string()))
    }

    /// Commits once the requests already queued have run.
    ///
    /// No request can be issued afterwards, including from listeners.
    /// Fails with `InvalidState` unless the transaction is active.
    pub fn commit(&self) -> Result<()> {
        {
            let mut state = self.database.engine().lock();
            let entry = state.txns.get_mut(&self.id).ok_or_else(|| self.finished())?;
            entry.txn.request_commit()?;
        }
        tracing::debug!("Transaction {} commit requested", self.id);
        self.database.engine().notify();
        Ok(())
    }

    /// Aborts, discarding every staged effect. Pending requests fail with
    /// `Abort`.
    pub fn abort(&self) -> Result<()> {
        self.abort_with(DbError::Abort { txn: self.id })
    }

    pub(crate) fn abort_with(&self, error: DbError) -> Result<()> {
        {
            let mut state = self.database.engine().lock();
            let entry = state.txns.get_mut(&self.id).ok_or_else(|| self.finished())?;
            entry.txn.abort(error)?;
        }
        tracing::debug!("Transaction {} aborted", self.id);
        self.database.engine().notify();
        Ok(())
    }

    /// Waits for the terminal outcome.
    pub async fn done(&self) -> Result<()> {
        loop {
            if let Some(outcome) = self.shared.outcome() {
                return outcome;
            }
            self.database.engine().drive().await;
        }
    }

    pub(crate) fn enqueue(&self, store: &str, op: Operation) -> Result<Request> {
        self.database.engine().enqueue(self.id, store, op)
    }

    fn finished(&self) -> DbError {
        DbError::InvalidState(format!("transaction {} has finished", self.id))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("database", &self.database.name())
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .finish()
    }
}
