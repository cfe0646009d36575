//! Object store handles.

use serde_json::Value;

use objectdb_core::key::{Key, KeyRange};

use crate::request::{Operation, Request};
use crate::transaction::Transaction;
use crate::Result;

/// Handle to one object store within a transaction.
///
/// Every operation queues a [`Request`]; issuing fails synchronously with
/// `TransactionInactive` unless the transaction is active, and writes fail
/// with `ReadOnly` on readonly transactions. Data errors such as
/// `Constraint` are delivered through the request.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    txn: Transaction,
    name: String,
}

impl ObjectStore {
    pub(crate) fn new(txn: Transaction, name: String) -> Self {
        Self { txn, name }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    fn issue(&self, op: Operation) -> Result<Request> {
        self.txn.enqueue(&self.name, op)
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: impl Into<Key>) -> Result<Request> {
        self.issue(Operation::Get(key.into()))
    }

    /// Reads values in `range`, at most `count`.
    pub fn get_all(&self, range: impl Into<KeyRange>, count: Option<usize>) -> Result<Request> {
        self.issue(Operation::GetAll {
            range: range.into(),
            count,
        })
    }

    /// Reads keys in `range`, at most `count`.
    pub fn get_all_keys(
        &self,
        range: impl Into<KeyRange>,
        count: Option<usize>,
    ) -> Result<Request> {
        self.issue(Operation::GetAllKeys {
            range: range.into(),
            count,
        })
    }

    /// Counts records in `range`.
    pub fn count(&self, range: impl Into<KeyRange>) -> Result<Request> {
        self.issue(Operation::Count(range.into()))
    }

    /// Inserts or overwrites a record. `key` is the out-of-line key; stores
    /// with a key path take the key from `value`.
    pub fn put(&self, value: Value, key: Option<Key>) -> Result<Request> {
        self.issue(Operation::Put {
            value,
            key,
            no_overwrite: false,
        })
    }

    /// Inserts a record; the request fails with `Constraint` if the key
    /// already exists.
    pub fn add(&self, value: Value, key: Option<Key>) -> Result<Request> {
        self.issue(Operation::Put {
            value,
            key,
            no_overwrite: true,
        })
    }

    /// Deletes the record at a key, or every record in a range.
    pub fn delete(&self, range: impl Into<KeyRange>) -> Result<Request> {
        self.issue(Operation::Delete(range.into()))
    }

    /// Deletes every record.
    pub fn clear(&self) -> Result<Request> {
        self.issue(Operation::Clear)
    }
}
