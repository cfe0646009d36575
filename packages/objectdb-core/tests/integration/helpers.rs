//! Fixtures shared by the integration tests.

use std::collections::BTreeSet;

use objectdb_core::database::DatabaseState;
use objectdb_core::object_store::StoreParameters;
use objectdb_core::transaction::{Transaction, TransactionMode};
use objectdb_core::usage::UsageAccountant;

pub fn scope(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Commits a version change creating `stores` on `db`.
pub fn upgrade(
    db: &DatabaseState,
    accountant: &mut UsageAccountant,
    id: u64,
    version: u64,
    stores: &[(&str, StoreParameters)],
) {
    let base = db.load();
    let mut txn = Transaction::new(id, TransactionMode::VersionChange, scope(&[]), &base);
    txn.set_target_version(version).unwrap();
    for (name, params) in stores {
        txn.create_store(&base, name, params.clone()).unwrap();
    }
    txn.request_commit().unwrap();
    db.commit_transaction(&mut txn, accountant, None).unwrap();
}

/// Starts a readwrite transaction over `stores`.
pub fn writer(db: &DatabaseState, id: u64, stores: &[&str]) -> Transaction {
    Transaction::new(id, TransactionMode::ReadWrite, scope(stores), &db.load())
}
