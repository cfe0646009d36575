//! Engine state and the tick that drives every transaction.
//!
//! A tick runs four phases in order:
//! 1. transactions that issued nothing since the previous tick become
//!    inactive,
//! 2. queued transactions are admitted by the scheduler,
//! 3. each admitted transaction executes the requests queued at the start
//!    of its turn (bounded by `max_requests_per_tick`) and dispatches their
//!    listeners outside the engine lock,
//! 4. committing transactions, and inactive ones whose queue drained, are
//!    merged into their database; aborted ones are retired.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use objectdb_core::config::{DbConfig, DeletePolicy};
use objectdb_core::database::DatabaseState;
use objectdb_core::error::DbError;
use objectdb_core::persistence::PersistenceManager;
use objectdb_core::transaction::{Transaction, TransactionMode, TransactionState};
use objectdb_core::usage::UsageAccountant;

use crate::listener::{self, ErrorSink};
use crate::request::{Operation, Outcome, PendingRequest, Request, RequestResult, RequestShared};
use crate::scheduler::{self, Claim};
use crate::Result;

/// Terminal outcome shared between a transaction handle and the engine.
#[derive(Default)]
pub(crate) struct TxnShared {
    outcome: Mutex<Option<Result<()>>>,
}

impl TxnShared {
    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        self.outcome.lock().clone()
    }

    fn resolve(&self, result: Result<()>) {
        *self.outcome.lock() = Some(result);
    }
}

/// A live transaction and its request queue.
pub(crate) struct TxnEntry {
    /// Database the transaction runs against
    pub(crate) database: Arc<DatabaseState>,
    /// Connection that created it
    pub(crate) connection: u64,
    /// State machine and staged effects
    pub(crate) txn: Transaction,
    /// Requests in issue order
    queue: VecDeque<PendingRequest>,
    /// Admitted by the scheduler
    started: bool,
    /// Issued something since the last tick
    touched: bool,
    /// A listener of this transaction is running
    dispatching: bool,
    /// A driver is executing this transaction's queue
    working: bool,
    /// Terminal outcome slot
    shared: Arc<TxnShared>,
}

impl TxnEntry {
    fn claim(&self) -> Claim<'_> {
        Claim {
            database: self.database.name(),
            mode: self.txn.mode(),
            scope: self.txn.scope(),
        }
    }

    /// Records caller activity. Requests issued from listeners do not keep
    /// the transaction active on their own.
    pub(crate) fn touch(&mut self) {
        if !self.dispatching {
            self.touched = true;
        }
    }

    fn execute(&mut self, store: &str, op: Operation) -> Outcome {
        if self.txn.state() == TransactionState::Aborted {
            return Err(DbError::Abort {
                txn: self.txn.id(),
            });
        }
        let base = self.database.load();
        match op {
            Operation::Get(key) => self.txn.get(&base, store, &key).map(RequestResult::Value),
            Operation::GetAll { range, count } => self
                .txn
                .get_all(&base, store, &range, count)
                .map(RequestResult::Values),
            Operation::GetAllKeys { range, count } => self
                .txn
                .get_all_keys(&base, store, &range, count)
                .map(RequestResult::Keys),
            Operation::Count(range) => self
                .txn
                .count(&base, store, &range)
                .map(RequestResult::Count),
            Operation::Put {
                value,
                key,
                no_overwrite,
            } => self
                .txn
                .put(&base, store, value, key, no_overwrite)
                .map(RequestResult::Key),
            Operation::Delete(range) => self
                .txn
                .delete(&base, store, &range)
                .map(|()| RequestResult::Done),
            Operation::Clear => self.txn.clear(&base, store).map(|()| RequestResult::Done),
        }
    }
}

/// An open connection.
struct ConnectionEntry {
    /// Database name
    database: String,
    /// Set by `close()` or when the last handle drops
    closed: Arc<AtomicBool>,
}

/// Identity of a freshly registered connection.
pub(crate) struct ConnectionTicket {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) closed: Arc<AtomicBool>,
}

/// Result of one attempt to open a database.
pub(crate) enum OpenStep {
    /// Connected at the current version
    Ready(ConnectionTicket),
    /// Connected; a version change transaction was created
    Upgrade {
        connection: ConnectionTicket,
        txn: u64,
        shared: Arc<TxnShared>,
        old_version: u64,
        new_version: u64,
    },
    /// Other transactions must finish first
    Wait,
}

/// Everything guarded by the engine lock.
pub(crate) struct EngineState {
    /// Engine configuration
    pub(crate) config: DbConfig,
    /// Databases by name, including ones still waiting for their first
    /// version change
    pub(crate) databases: BTreeMap<String, Arc<DatabaseState>>,
    /// Open connections by id
    connections: BTreeMap<u64, ConnectionEntry>,
    /// Live transactions by id; ids grow in creation order
    pub(crate) txns: BTreeMap<u64, TxnEntry>,
    /// Usage records
    pub(crate) accountant: UsageAccountant,
    /// Durable storage, if configured
    persistence: Option<PersistenceManager>,
    /// Next transaction id
    next_txn: u64,
    /// Next connection id
    next_connection: u64,
    /// Set by `shutdown`
    pub(crate) shut_down: bool,
}

impl EngineState {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(DbError::InvalidState("engine has been shut down".to_string()));
        }
        Ok(())
    }

    fn register_connection(&mut self, name: &str) -> ConnectionTicket {
        let id = self.next_connection;
        self.next_connection += 1;
        let closed = Arc::new(AtomicBool::new(false));
        self.connections.insert(
            id,
            ConnectionEntry {
                database: name.to_string(),
                closed: closed.clone(),
            },
        );
        tracing::debug!("Connection {} opened to '{}'", id, name);
        ConnectionTicket {
            id,
            name: name.to_string(),
            closed,
        }
    }

    /// Drops closed connections that no longer own a live transaction.
    fn release_closed_connections(&mut self) -> bool {
        let busy: BTreeSet<u64> = self.txns.values().map(|e| e.connection).collect();
        let before = self.connections.len();
        self.connections.retain(|id, conn| {
            let release = conn.closed.load(Ordering::Acquire) && !busy.contains(id);
            if release {
                tracing::debug!("Connection {} to '{}' released", id, conn.database);
            }
            !release
        });
        before != self.connections.len()
    }

    fn open_connections(&self, name: &str) -> usize {
        self.connections
            .values()
            .filter(|c| c.database == name)
            .count()
    }

    /// Returns `true` if `connection` owns a live version change.
    pub(crate) fn upgrading(&self, connection: u64) -> bool {
        self.txns.values().any(|e| {
            e.connection == connection
                && e.txn.mode() == TransactionMode::VersionChange
                && !e.txn.state().is_terminal()
        })
    }

    /// Creates a transaction in the `active` state, not yet admitted.
    pub(crate) fn begin_transaction(
        &mut self,
        database: &Arc<DatabaseState>,
        connection: u64,
        mode: TransactionMode,
        scope: BTreeSet<String>,
        target_version: Option<u64>,
    ) -> Result<(u64, Arc<TxnShared>)> {
        self.ensure_running()?;
        let id = self.next_txn;
        self.next_txn += 1;

        let mut txn = Transaction::new(id, mode, scope, &database.load());
        if let Some(version) = target_version {
            txn.set_target_version(version)?;
        }
        let shared = Arc::new(TxnShared::default());
        tracing::debug!(
            "Transaction {} created on '{}' ({}, {} stores)",
            id,
            database.name(),
            mode,
            txn.scope().len()
        );
        self.txns.insert(
            id,
            TxnEntry {
                database: database.clone(),
                connection,
                txn,
                queue: VecDeque::new(),
                started: false,
                touched: true,
                dispatching: false,
                working: false,
                shared: shared.clone(),
            },
        );
        Ok((id, shared))
    }

    /// Connects to `name`, creating a version change when `version` is
    /// above the stored one.
    pub(crate) fn begin_open(&mut self, name: &str, version: Option<u64>) -> Result<OpenStep> {
        self.ensure_running()?;
        let database = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DatabaseState::new(name.to_string())))
            .clone();

        let current = database.version();
        let requested = version.unwrap_or_else(|| current.max(1));
        if requested < current {
            return Err(DbError::Version {
                database: name.to_string(),
                requested,
                current,
            });
        }
        if requested == current {
            return Ok(OpenStep::Ready(self.register_connection(name)));
        }
        // Upgrades wait for every in-flight transaction on the database
        if self.txns.values().any(|e| e.database.name() == name) {
            return Ok(OpenStep::Wait);
        }

        let connection = self.register_connection(name);
        let (txn, shared) = self.begin_transaction(
            &database,
            connection.id,
            TransactionMode::VersionChange,
            BTreeSet::new(),
            Some(requested),
        )?;
        Ok(OpenStep::Upgrade {
            connection,
            txn,
            shared,
            old_version: current,
            new_version: requested,
        })
    }

    /// Deletes `name` if no connection is open. Returns `false` when the
    /// caller should wait and retry.
    pub(crate) fn try_delete(&mut self, name: &str) -> Result<bool> {
        self.ensure_running()?;
        self.release_closed_connections();
        if !self.databases.contains_key(name) {
            return Ok(true);
        }

        let connections = self.open_connections(name);
        if connections > 0 {
            return match self.config.delete_policy {
                DeletePolicy::Error => Err(DbError::DatabaseBusy {
                    database: name.to_string(),
                    connections,
                }),
                DeletePolicy::Block => Ok(false),
            };
        }

        if let Some(persistence) = &self.persistence {
            persistence.remove_database(name)?;
        }
        self.databases.remove(name);
        self.accountant.remove(name);
        tracing::info!("Deleted database '{}'", name);
        Ok(true)
    }

    fn deactivate_idle(&mut self) -> bool {
        let mut progress = false;
        for (id, entry) in self.txns.iter_mut() {
            if entry.working || entry.txn.state() != TransactionState::Active {
                continue;
            }
            if entry.touched {
                entry.touched = false;
                progress = true;
            } else if entry.txn.deactivate() {
                tracing::debug!("Transaction {} inactive", id);
                progress = true;
            }
        }
        progress
    }

    fn admit(&mut self) -> bool {
        let mut admitted = Vec::new();
        {
            let live: Vec<(u64, &TxnEntry)> = self
                .txns
                .iter()
                .filter(|(_, e)| !e.txn.state().is_terminal())
                .map(|(id, e)| (*id, e))
                .collect();
            for (i, (id, entry)) in live.iter().enumerate() {
                if entry.started {
                    continue;
                }
                let earlier = live[..i].iter().map(|(_, e)| e.claim());
                if scheduler::can_admit(&entry.claim(), earlier) {
                    admitted.push(*id);
                }
            }
        }
        for id in &admitted {
            if let Some(entry) = self.txns.get_mut(id) {
                entry.started = true;
                tracing::debug!("Transaction {} started", id);
            }
        }
        !admitted.is_empty()
    }

    /// Transactions whose queue may be worked this tick.
    fn runnable(&self) -> Vec<u64> {
        self.txns
            .iter()
            .filter(|(_, e)| !e.working)
            .filter(|(_, e)| e.started || e.txn.state() == TransactionState::Aborted)
            .map(|(id, _)| *id)
            .collect()
    }

    fn finalize(&mut self) -> bool {
        let ready: Vec<u64> = self
            .txns
            .iter()
            .filter(|(_, e)| {
                !e.working
                    && e.queue.is_empty()
                    && match e.txn.state() {
                        TransactionState::Committing | TransactionState::Inactive => e.started,
                        TransactionState::Aborted => true,
                        _ => false,
                    }
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &ready {
            let Some(mut entry) = self.txns.remove(id) else {
                continue;
            };
            let result = if entry.txn.state() == TransactionState::Aborted {
                let error = entry
                    .txn
                    .error()
                    .cloned()
                    .unwrap_or(DbError::Abort { txn: *id });
                tracing::debug!("Transaction {} aborted: {}", id, error);
                Err(error)
            } else {
                entry.txn.begin_commit();
                match entry.database.commit_transaction(
                    &mut entry.txn,
                    &mut self.accountant,
                    self.persistence.as_ref(),
                ) {
                    Ok(()) => {
                        tracing::debug!("Transaction {} committed", id);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Transaction {} failed to commit: {}", id, e);
                        entry.txn.fail(e.clone());
                        Err(e)
                    }
                }
            };
            entry.shared.resolve(result);
        }
        !ready.is_empty()
    }
}

/// The engine: shared state, a progress signal, and the error sink.
pub(crate) struct Engine {
    state: Mutex<EngineState>,
    progress: Notify,
    sink: Arc<dyn ErrorSink>,
    next_request: AtomicU64,
}

impl Engine {
    /// Creates the engine, loading persisted databases if configured.
    pub(crate) fn new(config: DbConfig, sink: Arc<dyn ErrorSink>) -> Result<Self> {
        let persistence = PersistenceManager::from_config(&config)?;
        let mut accountant = UsageAccountant::new(&config);
        let mut databases = BTreeMap::new();

        if let Some(persistence) = &persistence {
            for (name, snapshot) in persistence.load_all()? {
                let record = accountant.measure(&name, &snapshot);
                accountant.apply(record);
                databases.insert(
                    name.clone(),
                    Arc::new(DatabaseState::from_snapshot(name, snapshot)),
                );
            }
            persistence.remove_orphaned_images()?;
            tracing::info!(
                "Loaded {} database(s) from {}",
                databases.len(),
                persistence.data_dir().display()
            );
        }

        Ok(Self {
            state: Mutex::new(EngineState {
                config,
                databases,
                connections: BTreeMap::new(),
                txns: BTreeMap::new(),
                accountant,
                persistence,
                next_txn: 1,
                next_connection: 1,
                shut_down: false,
            }),
            progress: Notify::new(),
            sink,
            next_request: AtomicU64::new(1),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    /// Wakes every task waiting for engine progress.
    pub(crate) fn notify(&self) {
        self.progress.notify_waiters();
    }

    /// Queues a request on transaction `txn`.
    pub(crate) fn enqueue(self: &Arc<Self>, txn: u64, store: &str, op: Operation) -> Result<Request> {
        let shared = {
            let mut state = self.state.lock();
            let entry = state
                .txns
                .get_mut(&txn)
                .ok_or(DbError::TransactionInactive { txn })?;
            entry.txn.ensure_can_issue()?;
            if op.is_write() && !entry.txn.mode().can_write() {
                return Err(DbError::ReadOnly { txn });
            }

            let id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::new(RequestShared::new(id, txn, store.to_string()));
            tracing::debug!(
                "Transaction {} queued {} #{} on '{}'",
                txn,
                op.name(),
                id,
                store
            );
            entry.queue.push_back(PendingRequest {
                shared: shared.clone(),
                op,
            });
            entry.touch();
            shared
        };
        self.notify();
        Ok(Request::new(self.clone(), shared))
    }

    /// Runs one tick. Returns `true` if anything changed.
    pub(crate) fn tick(&self) -> bool {
        let (mut progress, runnable) = {
            let mut state = self.state.lock();
            let deactivated = state.deactivate_idle();
            let admitted = state.admit();
            (deactivated | admitted, state.runnable())
        };

        for id in runnable {
            progress |= self.run_requests(id);
        }

        {
            let mut state = self.state.lock();
            progress |= state.finalize();
            progress |= state.release_closed_connections();
        }

        if progress {
            self.notify();
        }
        progress
    }

    /// Executes the requests queued on `id` when its turn starts.
    ///
    /// Only one driver works a transaction at a time; a concurrent or
    /// re-entrant tick skips it until the current driver is done.
    fn run_requests(&self, id: u64) -> bool {
        let budget = {
            let mut state = self.state.lock();
            let limit = state.config.max_requests_per_tick;
            match state.txns.get_mut(&id) {
                Some(entry) if !entry.working => {
                    entry.working = true;
                    entry.queue.len().min(limit)
                }
                _ => return false,
            }
        };

        for _ in 0..budget {
            let (shared, outcome, listeners, reactivated) = {
                let mut state = self.state.lock();
                let Some(entry) = state.txns.get_mut(&id) else {
                    break;
                };
                let Some(PendingRequest { shared, op }) = entry.queue.pop_front() else {
                    break;
                };
                let name = op.name();
                let outcome = entry.execute(&shared.store, op);
                if let Err(e) = &outcome {
                    tracing::debug!("Request #{} ({}) of transaction {} failed: {}", shared.id, name, id, e);
                }
                let reactivated = entry.txn.reactivate();
                entry.dispatching = true;
                let (outcome, listeners) = shared.complete(outcome);
                (shared, outcome, listeners, reactivated)
            };

            listener::dispatch(self.sink.as_ref(), id, shared.id, &outcome, listeners);

            let mut state = self.state.lock();
            if let Some(entry) = state.txns.get_mut(&id) {
                entry.dispatching = false;
                if reactivated {
                    entry.txn.deactivate();
                }
            }
        }

        if let Some(entry) = self.state.lock().txns.get_mut(&id) {
            entry.working = false;
        }
        budget > 0
    }

    /// Ticks once, then yields if the tick made progress or waits for the
    /// next progress signal otherwise.
    pub(crate) async fn drive(&self) {
        let notified = self.progress.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.tick() {
            tokio::task::yield_now().await;
        } else {
            notified.await;
        }
    }

    /// Aborts every live transaction and closes every connection.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            for (id, entry) in state.txns.iter_mut() {
                if entry.txn.fail(DbError::Abort { txn: *id }) {
                    tracing::debug!("Transaction {} aborted by shutdown", id);
                }
            }
            for conn in state.connections.values() {
                conn.closed.store(true, Ordering::Release);
            }
        }
        while self.tick() {}
        tracing::info!("Engine shut down");
    }
}
