//! Connection handles and the version change context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use objectdb_core::error::DbError;
use objectdb_core::object_store::StoreParameters;
use objectdb_core::transaction::TransactionMode;

use crate::engine::{ConnectionTicket, Engine};
use crate::object_store::ObjectStore;
use crate::transaction::Transaction;
use crate::Result;

/// Name and committed version of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// Database name
    pub name: String,
    /// Committed schema version
    pub version: u64,
}

struct Connection {
    engine: Arc<Engine>,
    id: u64,
    name: String,
    closed: Arc<AtomicBool>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The engine releases the connection on its next tick
        self.closed.store(true, Ordering::Release);
        self.engine.notify();
    }
}

/// An open connection to a named database.
///
/// Clones share the connection; it closes when `close()` is called or the
/// last clone is dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Connection>,
}

impl Database {
    pub(crate) fn new(engine: Arc<Engine>, ticket: ConnectionTicket) -> Self {
        Self {
            inner: Arc::new(Connection {
                engine,
                id: ticket.id,
                name: ticket.name,
                closed: ticket.closed,
            }),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the committed schema version.
    pub fn version(&self) -> u64 {
        let state = self.inner.engine.lock();
        state
            .databases
            .get(&self.inner.name)
            .map(|db| db.version())
            .unwrap_or(0)
    }

    /// Names of the committed object stores.
    pub fn object_store_names(&self) -> Vec<String> {
        let state = self.inner.engine.lock();
        state
            .databases
            .get(&self.inner.name)
            .map(|db| db.load().store_names())
            .unwrap_or_default()
    }

    /// Returns `true` once `close()` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Starts a transaction over `stores`.
    ///
    /// # Errors
    /// * `InvalidState` if the connection is closing or a version change
    ///   is running on it
    /// * `InvalidAccess` if the scope is empty, names an unknown store, or
    ///   `mode` is `VersionChange`
    pub fn transaction<I, S>(&self, stores: I, mode: TransactionMode) -> Result<Transaction>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if mode == TransactionMode::VersionChange {
            return Err(DbError::InvalidAccess(
                "version change transactions are only created by open".to_string(),
            ));
        }
        let scope: BTreeSet<String> = stores.into_iter().map(Into::into).collect();

        let engine = self.inner.engine.clone();
        let (id, shared) = {
            let mut state = engine.lock();
            if self.is_closed() {
                return Err(DbError::InvalidState(format!(
                    "connection to '{}' is closing",
                    self.name()
                )));
            }
            if state.upgrading(self.inner.id) {
                return Err(DbError::InvalidState(format!(
                    "a version change is running on '{}'",
                    self.name()
                )));
            }
            if scope.is_empty() {
                return Err(DbError::InvalidAccess(
                    "a transaction needs at least one object store".to_string(),
                ));
            }
            let database = state.databases.get(self.name()).cloned().ok_or_else(|| {
                DbError::InvalidState(format!("database '{}' no longer exists", self.name()))
            })?;
            let snapshot = database.load();
            if let Some(missing) = scope.iter().find(|s| !snapshot.stores.contains_key(*s)) {
                return Err(DbError::InvalidAccess(format!(
                    "object store '{}' does not exist in '{}'",
                    missing,
                    self.name()
                )));
            }
            state.begin_transaction(&database, self.inner.id, mode, scope.clone(), None)?
        };
        engine.notify();
        Ok(Transaction::new(self.clone(), id, mode, scope, shared))
    }

    /// Closes the connection. Running transactions finish; new ones fail.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Connection {} to '{}' closing", self.inner.id, self.inner.name);
        }
        self.inner.engine.notify();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("connection", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Context handed to the upgrade callback of `open`.
pub struct VersionChange {
    database: Database,
    transaction: Transaction,
    old_version: u64,
    new_version: u64,
}

impl VersionChange {
    pub(crate) fn new(
        database: Database,
        transaction: Transaction,
        old_version: u64,
        new_version: u64,
    ) -> Self {
        Self {
            database,
            transaction,
            old_version,
            new_version,
        }
    }

    /// Connection being upgraded.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// The version change transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Version before the upgrade (0 for a new database).
    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    /// Version being committed.
    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    /// Creates an object store and returns a handle to it.
    pub fn create_object_store(&self, name: &str, params: StoreParameters) -> Result<ObjectStore> {
        let id = self.transaction.id();
        {
            let mut state = self.database.engine().lock();
            let entry = state
                .txns
                .get_mut(&id)
                .ok_or(DbError::TransactionInactive { txn: id })?;
            entry.txn.ensure_can_issue()?;
            let base = entry.database.load();
            entry.txn.create_store(&base, name, params)?;
            entry.touch();
        }
        tracing::info!(
            "Created object store '{}' in '{}' (version {})",
            name,
            self.database.name(),
            self.new_version
        );
        Ok(ObjectStore::new(self.transaction.clone(), name.to_string()))
    }

    /// Removes an object store and all of its records.
    pub fn delete_object_store(&self, name: &str) -> Result<()> {
        let id = self.transaction.id();
        {
            let mut state = self.database.engine().lock();
            let entry = state
                .txns
                .get_mut(&id)
                .ok_or(DbError::TransactionInactive { txn: id })?;
            entry.txn.ensure_can_issue()?;
            let base = entry.database.load();
            entry.txn.delete_store(&base, name)?;
            entry.touch();
        }
        tracing::info!(
            "Deleted object store '{}' from '{}' (version {})",
            name,
            self.database.name(),
            self.new_version
        );
        Ok(())
    }

    /// Store names as seen by the upgrade.
    pub fn object_store_names(&self) -> Vec<String> {
        self.transaction.object_store_names()
    }
}
