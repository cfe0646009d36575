//! Commit, abort and isolation against shared database state.

use std::sync::Arc;
use std::thread;

use serde_json::json;

use objectdb_core::config::DbConfig;
use objectdb_core::database::DatabaseState;
use objectdb_core::error::DbError;
use objectdb_core::key::{Key, KeyRange};
use objectdb_core::object_store::StoreParameters;
use objectdb_core::transaction::{Transaction, TransactionMode, TransactionState};
use objectdb_core::usage::UsageAccountant;

use super::helpers::{scope, upgrade, writer};

#[test]
fn test_commit_is_atomic_for_concurrent_readers() {
    let db = Arc::new(DatabaseState::new("library".to_string()));
    let mut accountant = UsageAccountant::new(&DbConfig::default());
    upgrade(
        &db,
        &mut accountant,
        1,
        1,
        &[("a", StoreParameters::default()), ("b", StoreParameters::default())],
    );

    // Readers check that both stores always hold the same number of records
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = db.load();
                    let a = snapshot.store("a").unwrap().record_count();
                    let b = snapshot.store("b").unwrap().record_count();
                    assert_eq!(a, b);
                }
            })
        })
        .collect();

    for i in 0..50i64 {
        let mut txn = writer(&db, 10 + i as u64, &["a", "b"]);
        let base = db.load();
        txn.put(&base, "a", json!(i), Some(Key::from(i)), false).unwrap();
        txn.put(&base, "b", json!(i), Some(Key::from(i)), false).unwrap();
        txn.request_commit().unwrap();
        db.commit_transaction(&mut txn, &mut accountant, None).unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.load().store("a").unwrap().record_count(), 50);
}

#[test]
fn test_aborted_effects_are_never_published() {
    let db = DatabaseState::new("library".to_string());
    let mut accountant = UsageAccountant::new(&DbConfig::default());
    upgrade(&db, &mut accountant, 1, 1, &[("books", StoreParameters::with_key_path("isbn"))]);

    let mut txn = writer(&db, 2, &["books"]);
    txn.put(&db.load(), "books", json!({"isbn": "one"}), None, false)
        .unwrap();
    txn.abort(DbError::Abort { txn: 2 }).unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(!txn.has_staged_changes());

    // A terminal transaction cannot be committed or aborted again
    assert!(matches!(txn.request_commit(), Err(DbError::InvalidState(_))));
    assert!(matches!(
        txn.abort(DbError::Abort { txn: 2 }),
        Err(DbError::InvalidState(_))
    ));
    assert_eq!(db.load().store("books").unwrap().record_count(), 0);
}

#[test]
fn test_later_transaction_sees_committed_writes_only() {
    let db = DatabaseState::new("library".to_string());
    let mut accountant = UsageAccountant::new(&DbConfig::default());
    upgrade(&db, &mut accountant, 1, 1, &[("books", StoreParameters::with_key_path("isbn"))]);

    let mut first = writer(&db, 2, &["books"]);
    for (isbn, title) in [("one", "t1"), ("two", "t2"), ("three", "t3")] {
        first
            .put(&db.load(), "books", json!({"isbn": isbn, "title": title}), None, false)
            .unwrap();
    }

    let reader = Transaction::new(3, TransactionMode::ReadOnly, scope(&["books"]), &db.load());
    assert_eq!(
        reader
            .count(&db.load(), "books", &KeyRange::all())
            .unwrap(),
        0
    );

    first.request_commit().unwrap();
    db.commit_transaction(&mut first, &mut accountant, None).unwrap();

    let reader = Transaction::new(4, TransactionMode::ReadOnly, scope(&["books"]), &db.load());
    for (isbn, title) in [("one", "t1"), ("two", "t2"), ("three", "t3")] {
        let value = reader
            .get(&db.load(), "books", &Key::from(isbn))
            .unwrap()
            .unwrap();
        assert_eq!(value["title"], title);
    }
}

#[test]
fn test_version_change_replaces_schema_atomically() {
    let db = DatabaseState::new("library".to_string());
    let mut accountant = UsageAccountant::new(&DbConfig::default());
    upgrade(&db, &mut accountant, 1, 1, &[("old", StoreParameters::default())]);

    let base = db.load();
    let mut txn = Transaction::new(2, TransactionMode::VersionChange, scope(&[]), &base);
    txn.set_target_version(2).unwrap();
    txn.delete_store(&base, "old").unwrap();
    txn.create_store(&base, "new", StoreParameters::default().auto_increment())
        .unwrap();
    let key = txn.put(&base, "new", json!("first"), None, false).unwrap();
    assert_eq!(key, Key::from(1i64));

    // Nothing is visible before the commit
    assert_eq!(db.version(), 1);
    assert_eq!(db.load().store_names(), vec!["old".to_string()]);

    txn.request_commit().unwrap();
    db.commit_transaction(&mut txn, &mut accountant, None).unwrap();
    assert_eq!(db.version(), 2);
    let snapshot = db.load();
    assert_eq!(snapshot.store_names(), vec!["new".to_string()]);
    assert_eq!(snapshot.store("new").unwrap().key_generator, 2);
}
