//! Object store metadata and committed record storage.
//!
//! Each committed store is immutable once published; commits clone the
//! store (copy-on-write) and publish a new `Arc<StoreData>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, Result};
use crate::key::Key;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Largest key the generator hands out (2^53).
pub const MAX_GENERATED_KEY: u64 = 1 << 53;

/// Options supplied when creating an object store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParameters {
    /// Dotted path locating in-line keys inside values
    pub key_path: Option<String>,
    /// Whether the store owns a key generator
    pub auto_increment: bool,
}

impl StoreParameters {
    /// Store with in-line keys at `key_path`.
    pub fn with_key_path(key_path: impl Into<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            auto_increment: false,
        }
    }

    /// Store with a key generator.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// A committed record and its accounted size.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Record value
    pub value: Arc<Value>,
    /// Serialized key + value size in bytes
    pub size: u64,
}

/// Computes the accounted size of a record.
pub fn record_size(key: &Key, value: &Value) -> Result<u64> {
    let encoded =
        serde_json::to_vec(value).map_err(|e| DbError::Serialization(e.to_string()))?;
    Ok(key.encoded_len() + encoded.len() as u64)
}

/// Committed contents of one object store.
#[derive(Debug, Clone)]
pub struct StoreData {
    /// Store name
    pub name: String,
    /// Creation parameters
    pub params: StoreParameters,
    /// Records ordered by key
    pub records: BTreeMap<Key, StoredRecord>,
    /// Next key the generator hands out
    pub key_generator: u64,
    /// Sum of record sizes
    data_bytes: u64,
}

impl StoreData {
    /// Creates an empty store.
    pub fn new(name: String, params: StoreParameters) -> Self {
        Self {
            name,
            params,
            records: BTreeMap::new(),
            key_generator: 1,
            data_bytes: 0,
        }
    }

    /// Rebuilds a store from persisted records, recomputing sizes.
    pub fn from_records(
        name: String,
        params: StoreParameters,
        key_generator: u64,
        records: Vec<(Key, Value)>,
    ) -> Result<Self> {
        #[cfg(feature = "parallel")]
        let sized: Vec<(Key, StoredRecord)> = records
            .into_par_iter()
            .map(|(key, value)| {
                let size = record_size(&key, &value)?;
                Ok((
                    key,
                    StoredRecord {
                        value: Arc::new(value),
                        size,
                    },
                ))
            })
            .collect::<Result<_>>()?;

        #[cfg(not(feature = "parallel"))]
        let sized: Vec<(Key, StoredRecord)> = records
            .into_iter()
            .map(|(key, value)| {
                let size = record_size(&key, &value)?;
                Ok((
                    key,
                    StoredRecord {
                        value: Arc::new(value),
                        size,
                    },
                ))
            })
            .collect::<Result<_>>()?;

        let data_bytes = sized.iter().map(|(_, r)| r.size).sum();
        Ok(Self {
            name,
            params,
            records: sized.into_iter().collect(),
            key_generator: key_generator.max(1),
            data_bytes,
        })
    }

    /// Looks up a committed record value.
    pub fn get(&self, key: &Key) -> Option<&Arc<Value>> {
        self.records.get(key).map(|r| &r.value)
    }

    /// Inserts or overwrites a record, keeping the byte tally current.
    pub fn insert(&mut self, key: Key, value: Arc<Value>, size: u64) {
        if let Some(old) = self.records.insert(key, StoredRecord { value, size }) {
            self.data_bytes -= old.size;
        }
        self.data_bytes += size;
    }

    /// Removes a record, keeping the byte tally current.
    pub fn remove(&mut self, key: &Key) {
        if let Some(old) = self.records.remove(key) {
            self.data_bytes -= old.size;
        }
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.data_bytes = 0;
    }

    /// Sum of committed record sizes in bytes.
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Number of committed records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
