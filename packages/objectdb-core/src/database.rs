//! Committed database state published through atomic snapshots.
//!
//! Readers load an `Arc<Snapshot>` and never observe a partially merged
//! commit: a commit builds a complete new snapshot and swaps it in.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{DbError, Result};
use crate::object_store::StoreData;
use crate::persistence::PersistenceManager;
use crate::transaction::Transaction;
use crate::usage::UsageAccountant;

/// Immutable view of a database at one committed point.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Schema version (0 until the first version change commits)
    pub version: u64,
    /// Object stores by name
    pub stores: BTreeMap<String, Arc<StoreData>>,
}

impl Snapshot {
    /// Looks up a committed store.
    pub fn store(&self, name: &str) -> Result<&Arc<StoreData>> {
        self.stores.get(name).ok_or_else(|| DbError::NotFound {
            store: name.to_string(),
        })
    }

    /// Names of all stores in sorted order.
    pub fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}

/// Durable mapping and schema version of one named database.
#[derive(Debug)]
pub struct DatabaseState {
    /// Database name
    name: String,
    /// Current committed snapshot
    snapshot: ArcSwap<Snapshot>,
}

impl DatabaseState {
    /// Creates a database that has not committed any version yet.
    pub fn new(name: String) -> Self {
        Self::from_snapshot(name, Snapshot::default())
    }

    /// Creates a database from a loaded snapshot.
    pub fn from_snapshot(name: String, snapshot: Snapshot) -> Self {
        Self {
            name,
            snapshot: ArcSwap::new(Arc::new(snapshot)),
        }
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads the current committed snapshot.
    pub fn load(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Returns the committed schema version.
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Returns `true` once a version change has committed.
    pub fn exists(&self) -> bool {
        self.version() > 0
    }

    /// Commits a transaction into this database.
    ///
    /// The new snapshot is measured, checked against the quota and
    /// persisted before it is published; the usage record is updated
    /// before the transaction is marked committed. Any failure leaves the
    /// committed state untouched and is returned to the caller, which
    /// aborts the transaction.
    pub fn commit_transaction(
        &self,
        txn: &mut Transaction,
        accountant: &mut UsageAccountant,
        persistence: Option<&PersistenceManager>,
    ) -> Result<()> {
        let base = self.load();
        let Some(next) = txn.build_commit(&base)? else {
            txn.mark_committed()?;
            return Ok(());
        };

        let record = accountant.measure(&self.name, &next);
        accountant.check_quota(&record)?;

        if let Some(persistence) = persistence {
            persistence.save_database(&self.name, &next)?;
        }

        tracing::debug!(
            "Transaction {} publishing '{}' at version {} ({} bytes)",
            txn.id(),
            self.name,
            next.version,
            record.byte_size
        );
        self.snapshot.store(Arc::new(next));
        accountant.apply(record);
        txn.mark_committed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::key::Key;
    use crate::object_store::StoreParameters;
    use crate::transaction::TransactionMode;
    use ntest::timeout;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn scope(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn create_books(db: &DatabaseState, accountant: &mut UsageAccountant) {
        let mut upgrade = Transaction::new(1, TransactionMode::VersionChange, scope(&[]), &db.load());
        upgrade.set_target_version(1).unwrap();
        upgrade
            .create_store(&db.load(), "books", StoreParameters::with_key_path("isbn"))
            .unwrap();
        upgrade.request_commit().unwrap();
        db.commit_transaction(&mut upgrade, accountant, None).unwrap();
    }

    #[timeout(1000)]
    #[test]
    fn test_commit_publishes_snapshot() {
        let db = DatabaseState::new("library".to_string());
        let mut accountant = UsageAccountant::new(&DbConfig::default());
        assert!(!db.exists());

        create_books(&db, &mut accountant);
        assert_eq!(db.version(), 1);
        assert_eq!(db.load().store_names(), vec!["books".to_string()]);

        let mut txn = Transaction::new(2, TransactionMode::ReadWrite, scope(&["books"]), &db.load());
        txn.put(&db.load(), "books", json!({"isbn": "one", "title": "t1"}), None, false)
            .unwrap();
        let before = db.load();
        txn.request_commit().unwrap();
        db.commit_transaction(&mut txn, &mut accountant, None).unwrap();

        // Old snapshot is untouched, new one has the record
        assert_eq!(before.store("books").unwrap().record_count(), 0);
        let after = db.load();
        let value = after.store("books").unwrap().get(&Key::from("one")).unwrap();
        assert_eq!(value["title"], "t1");
        assert!(txn.state().is_terminal());
    }

    #[timeout(1000)]
    #[test]
    fn test_quota_failure_leaves_state_untouched() {
        let db = DatabaseState::new("small".to_string());
        let config = DbConfig {
            quota_bytes: 1024,
            ..Default::default()
        };
        let mut accountant = UsageAccountant::new(&config);
        create_books(&db, &mut accountant);
        let usage_before = accountant.total();

        let mut txn = Transaction::new(2, TransactionMode::ReadWrite, scope(&["books"]), &db.load());
        let big = "x".repeat(4096);
        txn.put(&db.load(), "books", json!({"isbn": "big", "title": big}), None, false)
            .unwrap();
        txn.request_commit().unwrap();
        let result = db.commit_transaction(&mut txn, &mut accountant, None);

        assert!(matches!(result, Err(DbError::QuotaExceeded { .. })));
        assert_eq!(db.load().store("books").unwrap().record_count(), 0);
        assert_eq!(accountant.total(), usage_before);
    }
}
