//! Usage accounting across databases and subsystems.

use serde_json::json;

use objectdb_core::config::DbConfig;
use objectdb_core::database::DatabaseState;
use objectdb_core::key::{Key, KeyRange};
use objectdb_core::object_store::StoreParameters;
use objectdb_core::usage::{EstimateScope, UsageAccountant, DATABASES_SUBSYSTEM};

use super::helpers::{upgrade, writer};

#[test]
fn test_usage_follows_commits_and_deletes() {
    let a = DatabaseState::new("a".to_string());
    let b = DatabaseState::new("b".to_string());
    let mut accountant = UsageAccountant::new(&DbConfig::default());
    upgrade(&a, &mut accountant, 1, 1, &[("s", StoreParameters::default())]);
    upgrade(&b, &mut accountant, 2, 1, &[("s", StoreParameters::default())]);
    accountant.report_subsystem("caches", 42);

    let b_before = accountant.estimate(&EstimateScope::Database("b".to_string()));
    let a_before = accountant.estimate(&EstimateScope::Database("a".to_string()));

    let mut txn = writer(&a, 3, &["s"]);
    for i in 0..10i64 {
        txn.put(&a.load(), "s", json!("x".repeat(100)), Some(Key::from(i)), false)
            .unwrap();
    }
    txn.request_commit().unwrap();
    a.commit_transaction(&mut txn, &mut accountant, None).unwrap();

    let a_after = accountant.estimate(&EstimateScope::Database("a".to_string()));
    assert!(a_after.usage >= a_before.usage + 1000);
    assert_eq!(
        accountant.estimate(&EstimateScope::Database("b".to_string())),
        b_before
    );

    // Deleting records gives the bytes back
    let mut txn = writer(&a, 4, &["s"]);
    txn.delete(&a.load(), "s", &KeyRange::all()).unwrap();
    txn.request_commit().unwrap();
    a.commit_transaction(&mut txn, &mut accountant, None).unwrap();
    assert_eq!(
        accountant.estimate(&EstimateScope::Database("a".to_string())),
        a_before
    );

    let origin = accountant.estimate(&EstimateScope::Origin);
    assert_eq!(origin.usage, origin.usage_details.values().sum::<u64>());
    assert_eq!(origin.usage_details["caches"], 42);
    assert_eq!(
        origin.usage_details[DATABASES_SUBSYSTEM],
        accountant.databases_total()
    );

    accountant.remove("a");
    let origin = accountant.estimate(&EstimateScope::Origin);
    assert_eq!(
        origin.usage_details[DATABASES_SUBSYSTEM],
        accountant.record("b").unwrap().byte_size
    );
}
