//! Tick-driven transaction engine with asynchronous request handles.
//!
//! [`Factory`] opens named databases, deletes them, lists them, and
//! reports storage usage. Connections hand out transactions, transactions
//! hand out object stores, and every object-store operation returns a
//! [`Request`] that resolves once the engine executes it.
//!
//! Nothing runs in the background: awaiting a request, a transaction, or
//! a factory operation drives the engine one tick at a time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

mod database;
mod engine;
mod listener;
mod object_store;
mod request;
mod scheduler;
mod transaction;

pub use database::{Database, DatabaseInfo, VersionChange};
pub use listener::{ErrorSink, ListenerError, TracingErrorSink};
pub use object_store::ObjectStore;
pub use request::{Outcome, Request, RequestResult, RequestState};
pub use transaction::Transaction;

pub use objectdb_core::config::{DbConfig, DeletePolicy};
pub use objectdb_core::error::DbError;
pub use objectdb_core::key::{Key, KeyRange};
pub use objectdb_core::object_store::StoreParameters;
pub use objectdb_core::transaction::{TransactionMode, TransactionState};
pub use objectdb_core::usage::{EstimateScope, StorageEstimate, DATABASES_SUBSYSTEM};

use engine::{Engine, OpenStep};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Entry point: owns the engine and every database it manages.
///
/// Clones share the same engine.
#[derive(Clone)]
pub struct Factory {
    engine: Arc<Engine>,
}

impl Factory {
    /// Creates a factory reporting listener failures through `tracing`.
    ///
    /// With `config.data_dir` set, persisted databases are loaded first.
    pub fn new(config: DbConfig) -> Result<Self> {
        Self::with_error_sink(config, Arc::new(TracingErrorSink))
    }

    /// Creates a factory reporting listener failures to `sink`.
    pub fn with_error_sink(config: DbConfig, sink: Arc<dyn ErrorSink>) -> Result<Self> {
        Ok(Self {
            engine: Arc::new(Engine::new(config, sink)?),
        })
    }

    /// Opens `name` at `version` (the current version, or 1 for a new
    /// database, when `None`). No object stores are created on upgrade.
    pub async fn open(&self, name: &str, version: Option<u64>) -> Result<Database> {
        self.open_with_upgrade(name, version, |_| Ok(())).await
    }

    /// Opens `name`, running `upgrade` inside a version change transaction
    /// when `version` is above the stored version.
    ///
    /// The upgrade waits for every live transaction on the database. An
    /// error returned by `upgrade`, or a panic, aborts the version change
    /// and `open` fails.
    ///
    /// # Arguments
    /// * `name` - Database name
    /// * `version` - Requested version (must be at least 1)
    /// * `upgrade` - Schema callback, run with the version change active
    ///
    /// # Returns
    /// `Result<Database, DbError>` with the open connection.
    pub async fn open_with_upgrade<F>(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: F,
    ) -> Result<Database>
    where
        F: FnOnce(&VersionChange) -> Result<()>,
    {
        if version == Some(0) {
            return Err(DbError::Data("version must be at least 1".to_string()));
        }

        loop {
            let step = self.engine.lock().begin_open(name, version)?;
            match step {
                OpenStep::Wait => self.engine.drive().await,
                OpenStep::Ready(ticket) => {
                    tracing::debug!("Opened '{}'", name);
                    return Ok(Database::new(self.engine.clone(), ticket));
                }
                OpenStep::Upgrade {
                    connection,
                    txn,
                    shared,
                    old_version,
                    new_version,
                } => {
                    self.engine.notify();
                    let database = Database::new(self.engine.clone(), connection);
                    let transaction = Transaction::new(
                        database.clone(),
                        txn,
                        TransactionMode::VersionChange,
                        Default::default(),
                        shared,
                    );
                    tracing::info!(
                        "Upgrading '{}' from version {} to {}",
                        name,
                        old_version,
                        new_version
                    );

                    let context = VersionChange::new(
                        database.clone(),
                        transaction.clone(),
                        old_version,
                        new_version,
                    );
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| upgrade(&context)));
                    drop(context);

                    let failure = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(_) => {
                            tracing::error!("Upgrade callback for '{}' panicked", name);
                            Some(DbError::Abort { txn })
                        }
                    };

                    if let Some(error) = failure {
                        if let Err(e) = transaction.abort_with(error.clone()) {
                            tracing::debug!("Upgrade of '{}' already finished: {}", name, e);
                        }
                        // Wait for the abort to retire the transaction
                        let _ = transaction.done().await;
                        database.close();
                        return Err(error);
                    }

                    return match transaction.done().await {
                        Ok(()) => Ok(database),
                        Err(e) => {
                            database.close();
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Deletes `name` and all of its data.
    ///
    /// With open connections this fails with `DatabaseBusy` or waits,
    /// depending on the configured `DeletePolicy`. Deleting a database that
    /// does not exist succeeds.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        loop {
            let deleted = self.engine.lock().try_delete(name)?;
            if deleted {
                self.engine.notify();
                return Ok(());
            }
            self.engine.drive().await;
        }
    }

    /// Lists databases that have committed at least one version.
    pub fn databases(&self) -> Vec<DatabaseInfo> {
        let state = self.engine.lock();
        state
            .databases
            .values()
            .filter(|db| db.exists())
            .map(|db| DatabaseInfo {
                name: db.name().to_string(),
                version: db.version(),
            })
            .collect()
    }

    /// Estimates storage usage for `scope`.
    pub async fn estimate(&self, scope: EstimateScope) -> Result<StorageEstimate> {
        self.engine.tick();
        tokio::task::yield_now().await;
        let state = self.engine.lock();
        if state.shut_down {
            return Err(DbError::InvalidState("engine has been shut down".to_string()));
        }
        Ok(state.accountant.estimate(&scope))
    }

    /// Records the usage of another storage subsystem so that origin
    /// estimates include it.
    pub fn report_subsystem_usage(&self, subsystem: &str, bytes: u64) {
        self.engine.lock().accountant.report_subsystem(subsystem, bytes);
    }

    /// Runs one engine tick. Returns `true` if anything changed.
    pub fn tick(&self) -> bool {
        self.engine.tick()
    }

    /// Aborts every live transaction and closes every connection. The
    /// factory rejects further opens and deletes.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory").finish_non_exhaustive()
    }
}
