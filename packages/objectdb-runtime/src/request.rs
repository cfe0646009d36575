//! Request handles and their completion slots.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use objectdb_core::error::DbError;
use objectdb_core::key::{Key, KeyRange};

use crate::engine::Engine;
use crate::Result;

/// Outcome delivered to request listeners.
pub type Outcome = Result<RequestResult>;

/// Completion listener. A returned error or a panic is reported to the
/// factory's error sink and never changes the transaction outcome.
pub type Listener = Box<dyn FnOnce(&Outcome) -> anyhow::Result<()> + Send + 'static>;

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    /// `get`: the record value, if present
    Value(Option<Arc<Value>>),
    /// `get_all`: values in key order
    Values(Vec<Arc<Value>>),
    /// `put`/`add`: the effective key
    Key(Key),
    /// `get_all_keys`: keys in order
    Keys(Vec<Key>),
    /// `count`
    Count(u64),
    /// `delete`/`clear`
    Done,
}

impl RequestResult {
    /// Value of a `get`, if one was found.
    pub fn value(&self) -> Option<&Value> {
        match self {
            RequestResult::Value(value) => value.as_deref(),
            _ => None,
        }
    }

    /// Values of a `get_all`.
    pub fn values(&self) -> &[Arc<Value>] {
        match self {
            RequestResult::Values(values) => values,
            _ => &[],
        }
    }

    /// Key written by a `put` or `add`.
    pub fn key(&self) -> Option<&Key> {
        match self {
            RequestResult::Key(key) => Some(key),
            _ => None,
        }
    }

    /// Keys of a `get_all_keys`.
    pub fn keys(&self) -> &[Key] {
        match self {
            RequestResult::Keys(keys) => keys,
            _ => &[],
        }
    }

    /// Result of a `count`.
    pub fn count(&self) -> Option<u64> {
        match self {
            RequestResult::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued or executing
    Pending,
    /// Completed with a result
    Done,
    /// Completed with an error
    Failed,
}

/// Operation carried by a queued request.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Get(Key),
    GetAll {
        range: KeyRange,
        count: Option<usize>,
    },
    GetAllKeys {
        range: KeyRange,
        count: Option<usize>,
    },
    Count(KeyRange),
    Put {
        value: Value,
        key: Option<Key>,
        no_overwrite: bool,
    },
    Delete(KeyRange),
    Clear,
}

impl Operation {
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Put { .. } | Operation::Delete(_) | Operation::Clear
        )
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Get(_) => "get",
            Operation::GetAll { .. } => "get_all",
            Operation::GetAllKeys { .. } => "get_all_keys",
            Operation::Count(_) => "count",
            Operation::Put {
                no_overwrite: true, ..
            } => "add",
            Operation::Put { .. } => "put",
            Operation::Delete(_) => "delete",
            Operation::Clear => "clear",
        }
    }
}

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    listeners: Vec<Listener>,
}

/// State shared between a request handle and the engine queue.
pub(crate) struct RequestShared {
    pub(crate) id: u64,
    pub(crate) txn: u64,
    pub(crate) store: String,
    slot: Mutex<Slot>,
}

impl RequestShared {
    pub(crate) fn new(id: u64, txn: u64, store: String) -> Self {
        Self {
            id,
            txn,
            store,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Stores the outcome and hands back the listeners to dispatch.
    pub(crate) fn complete(&self, outcome: Outcome) -> (Outcome, Vec<Listener>) {
        let mut slot = self.slot.lock();
        slot.outcome = Some(outcome.clone());
        (outcome, std::mem::take(&mut slot.listeners))
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.slot.lock().outcome.clone()
    }
}

/// A pending operation queued on an engine transaction.
pub(crate) struct PendingRequest {
    pub(crate) shared: Arc<RequestShared>,
    pub(crate) op: Operation,
}

/// Handle to one read or write against a single object store.
///
/// Resolves once the owning transaction executes it; awaiting
/// [`Request::completed`] drives the engine until then.
#[derive(Clone)]
pub struct Request {
    engine: Arc<Engine>,
    shared: Arc<RequestShared>,
}

impl Request {
    pub(crate) fn new(engine: Arc<Engine>, shared: Arc<RequestShared>) -> Self {
        Self { engine, shared }
    }

    /// Engine-unique request id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Id of the owning transaction.
    pub fn transaction_id(&self) -> u64 {
        self.shared.txn
    }

    /// Name of the target object store.
    pub fn store_name(&self) -> &str {
        &self.shared.store
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        match self.shared.outcome() {
            None => RequestState::Pending,
            Some(Ok(_)) => RequestState::Done,
            Some(Err(_)) => RequestState::Failed,
        }
    }

    /// Result, once done.
    pub fn result(&self) -> Option<RequestResult> {
        self.shared.outcome().and_then(|o| o.ok())
    }

    /// Error, once failed.
    pub fn error(&self) -> Option<DbError> {
        self.shared.outcome().and_then(|o| o.err())
    }

    /// Registers a completion listener.
    ///
    /// Listeners run in registration order, after the request's effect has
    /// been applied and before the next request of the same transaction
    /// executes. Listeners added after completion are never called.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome) -> anyhow::Result<()> + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        if slot.outcome.is_none() {
            slot.listeners.push(Box::new(listener));
        }
    }

    /// Waits for the request to complete.
    pub async fn completed(&self) -> Outcome {
        loop {
            if let Some(outcome) = self.shared.outcome() {
                return outcome;
            }
            self.engine.drive().await;
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("txn", &self.shared.txn)
            .field("store", &self.shared.store)
            .field("state", &self.state())
            .finish()
    }
}
