//! Storage core for a transactional, versioned key-value object store.
//!
//! Provides keys and key ranges, copy-on-write object stores, the
//! transaction state machine with its staging buffers, snapshot-based
//! commit, usage accounting, and durable database images.

pub mod config;
pub mod database;
pub mod error;
pub mod key;
pub mod object_store;
pub mod persistence;
pub mod transaction;
pub mod usage;

pub use config::{DbConfig, DeletePolicy};
pub use database::{DatabaseState, Snapshot};
pub use error::{DbError, Result};
pub use key::{Key, KeyRange};
pub use object_store::{StoreData, StoreParameters};
pub use transaction::{Transaction, TransactionMode, TransactionState};
pub use usage::{EstimateScope, StorageEstimate, UsageAccountant, UsageRecord, DATABASES_SUBSYSTEM};
