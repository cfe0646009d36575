//! Durability through the persistence manager.

use serde_json::json;
use tempfile::tempdir;

use objectdb_core::config::DbConfig;
use objectdb_core::database::DatabaseState;
use objectdb_core::error::DbError;
use objectdb_core::key::Key;
use objectdb_core::object_store::StoreParameters;
use objectdb_core::persistence::PersistenceManager;
use objectdb_core::transaction::{Transaction, TransactionMode, TransactionState};
use objectdb_core::usage::{EstimateScope, UsageAccountant};

use super::helpers::{scope, writer};

#[test]
fn test_committed_state_reloads_with_identical_usage() {
    let temp_dir = tempdir().unwrap();
    let config = DbConfig::persistent(temp_dir.path());
    let persistence = PersistenceManager::from_config(&config).unwrap().unwrap();
    let mut accountant = UsageAccountant::new(&config);

    let db = DatabaseState::new("library".to_string());
    let base = db.load();
    let mut upgrade = Transaction::new(1, TransactionMode::VersionChange, scope(&[]), &base);
    upgrade.set_target_version(1).unwrap();
    upgrade
        .create_store(&base, "books", StoreParameters::with_key_path("isbn"))
        .unwrap();
    upgrade.request_commit().unwrap();
    db.commit_transaction(&mut upgrade, &mut accountant, Some(&persistence))
        .unwrap();

    let mut txn = writer(&db, 2, &["books"]);
    txn.put(&db.load(), "books", json!({"isbn": "one", "title": "t1"}), None, false)
        .unwrap();
    txn.put(&db.load(), "books", json!({"isbn": [1, "x"], "title": "compound"}), None, false)
        .unwrap();
    txn.request_commit().unwrap();
    db.commit_transaction(&mut txn, &mut accountant, Some(&persistence))
        .unwrap();
    let expected = accountant.estimate(&EstimateScope::Database("library".to_string()));

    // Fresh manager and accountant, as after a restart
    let reopened = PersistenceManager::open(temp_dir.path().to_path_buf(), &config).unwrap();
    let mut restored_accountant = UsageAccountant::new(&config);
    let loaded = reopened.load_all().unwrap();
    assert_eq!(loaded.len(), 1);
    let (name, snapshot) = loaded.into_iter().next().unwrap();
    let record = restored_accountant.measure(&name, &snapshot);
    restored_accountant.apply(record);
    assert_eq!(
        restored_accountant.estimate(&EstimateScope::Database("library".to_string())),
        expected
    );

    let restored = DatabaseState::from_snapshot(name, snapshot);
    assert_eq!(restored.version(), 1);
    let books = restored.load();
    let books = books.store("books").unwrap();
    assert_eq!(books.get(&Key::from("one")).unwrap()["title"], "t1");
    let compound = Key::Array(vec![Key::from(1i64), Key::from("x")]);
    assert_eq!(books.get(&compound).unwrap()["title"], "compound");
}

#[test]
fn test_persistence_failure_aborts_commit() {
    let temp_dir = tempdir().unwrap();
    let data_dir = temp_dir.path().join("data");
    let config = DbConfig {
        persistence_retry_delay_ms: 0,
        ..DbConfig::persistent(&data_dir)
    };
    let persistence = PersistenceManager::open(data_dir.clone(), &config).unwrap();
    // A regular file where the data directory should be
    std::fs::write(&data_dir, b"not a directory").unwrap();
    let mut accountant = UsageAccountant::new(&config);

    let db = DatabaseState::new("library".to_string());
    let base = db.load();
    let mut upgrade = Transaction::new(1, TransactionMode::VersionChange, scope(&[]), &base);
    upgrade.set_target_version(1).unwrap();
    upgrade
        .create_store(&base, "books", StoreParameters::default())
        .unwrap();
    upgrade.request_commit().unwrap();

    let result = db.commit_transaction(&mut upgrade, &mut accountant, Some(&persistence));
    assert!(matches!(result, Err(DbError::IoError(_))));
    assert_eq!(upgrade.state(), TransactionState::Committing);
    assert!(!db.exists());
    assert_eq!(accountant.databases_total(), 0);
}
