//! Storage usage accounting.
//!
//! One `UsageRecord` per database, refreshed from each committed snapshot.
//! The origin-wide usage is the sum of all records plus any usage that other
//! subsystems report; at every quiescent point the sum of per-scope records
//! equals the reported aggregate.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::DbConfig;
use crate::database::Snapshot;
use crate::error::{DbError, Result};

/// Subsystem name under which database usage is reported.
pub const DATABASES_SUBSYSTEM: &str = "databases";

/// Scope of a usage estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstimateScope {
    /// Everything this engine and reporting subsystems hold
    Origin,
    /// A single database, broken down by object store
    Database(String),
}

/// Result of a usage estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageEstimate {
    /// Bytes used within the scope
    pub usage: u64,
    /// Configured quota in bytes
    pub quota: u64,
    /// Breakdown of `usage`
    pub usage_details: BTreeMap<String, u64>,
}

/// Byte consumption of one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    /// Database name
    pub scope_id: String,
    /// Total bytes including metadata overhead
    pub byte_size: u64,
    /// Bytes per object store including store overhead
    pub stores: BTreeMap<String, u64>,
}

/// Tracks per-database usage and aggregates it on demand.
#[derive(Debug)]
pub struct UsageAccountant {
    /// Per-database records
    records: BTreeMap<String, UsageRecord>,
    /// Usage reported by other subsystems
    external: BTreeMap<String, u64>,
    /// Origin quota in bytes
    quota: u64,
    /// Fixed charge per database
    database_overhead: u64,
    /// Fixed charge per object store
    store_overhead: u64,
}

impl UsageAccountant {
    /// Creates an empty accountant.
    pub fn new(config: &DbConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            external: BTreeMap::new(),
            quota: config.quota_bytes,
            database_overhead: config.database_overhead_bytes,
            store_overhead: config.store_overhead_bytes,
        }
    }

    /// Computes the usage record `snapshot` would produce for `name`.
    pub fn measure(&self, name: &str, snapshot: &Snapshot) -> UsageRecord {
        let stores: BTreeMap<String, u64> = snapshot
            .stores
            .iter()
            .map(|(store_name, data)| {
                (
                    store_name.clone(),
                    self.store_overhead + store_name.len() as u64 + data.data_bytes(),
                )
            })
            .collect();
        let byte_size =
            self.database_overhead + name.len() as u64 + stores.values().sum::<u64>();
        UsageRecord {
            scope_id: name.to_string(),
            byte_size,
            stores,
        }
    }

    /// Fails with `QuotaExceeded` if replacing the record for
    /// `candidate.scope_id` would push total usage above the quota.
    ///
    /// Commits that do not grow usage always pass.
    pub fn check_quota(&self, candidate: &UsageRecord) -> Result<()> {
        let current = self
            .records
            .get(&candidate.scope_id)
            .map(|r| r.byte_size)
            .unwrap_or(0);
        if candidate.byte_size <= current {
            return Ok(());
        }
        let requested = self.total() - current + candidate.byte_size;
        if requested > self.quota {
            return Err(DbError::QuotaExceeded {
                requested,
                quota: self.quota,
            });
        }
        Ok(())
    }

    /// Stores a freshly measured record.
    pub fn apply(&mut self, record: UsageRecord) {
        tracing::debug!(
            "Usage for '{}' is now {} bytes",
            record.scope_id,
            record.byte_size
        );
        self.records.insert(record.scope_id.clone(), record);
    }

    /// Drops the record of a deleted database.
    pub fn remove(&mut self, name: &str) -> Option<UsageRecord> {
        self.records.remove(name)
    }

    /// Records usage reported by another subsystem.
    pub fn report_subsystem(&mut self, subsystem: &str, bytes: u64) {
        self.external.insert(subsystem.to_string(), bytes);
    }

    /// Returns the record for one database.
    pub fn record(&self, name: &str) -> Option<&UsageRecord> {
        self.records.get(name)
    }

    /// Bytes used by all databases.
    pub fn databases_total(&self) -> u64 {
        self.records.values().map(|r| r.byte_size).sum()
    }

    /// Bytes used by databases and reporting subsystems.
    pub fn total(&self) -> u64 {
        self.databases_total() + self.external.values().sum::<u64>()
    }

    /// Produces an estimate for `scope`.
    pub fn estimate(&self, scope: &EstimateScope) -> StorageEstimate {
        match scope {
            EstimateScope::Origin => {
                let mut usage_details = self.external.clone();
                usage_details.insert(DATABASES_SUBSYSTEM.to_string(), self.databases_total());
                StorageEstimate {
                    usage: usage_details.values().sum(),
                    quota: self.quota,
                    usage_details,
                }
            }
            EstimateScope::Database(name) => match self.records.get(name) {
                Some(record) => StorageEstimate {
                    usage: record.byte_size,
                    quota: self.quota,
                    usage_details: record.stores.clone(),
                },
                None => StorageEstimate {
                    usage: 0,
                    quota: self.quota,
                    usage_details: BTreeMap::new(),
                },
            },
        }
    }
}
