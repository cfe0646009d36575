use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::key::{Key, KeyRange};
use crate::object_store::StoreData;

use super::change::Change;

/// Transaction-local overlay of pending writes for one object store.
///
/// Reads consult the overlay first and fall back to the committed store.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    /// Name of the store this buffer belongs to
    pub store_name: String,
    /// Whether `clear()` hid every committed record
    pub cleared: bool,
    /// Changes keyed by record key
    pub changes: BTreeMap<Key, Change>,
    /// Staged key generator position
    pub key_generator: Option<u64>,
}

impl StagingBuffer {
    /// Creates an empty overlay for `store_name`.
    pub fn new(store_name: String) -> Self {
        Self {
            store_name,
            cleared: false,
            changes: BTreeMap::new(),
            key_generator: None,
        }
    }

    /// Returns the value visible for `key` through the overlay.
    pub fn lookup(&self, base: &StoreData, key: &Key) -> Option<Arc<Value>> {
        if let Some(change) = self.changes.get(key) {
            return change.value().cloned();
        }
        if self.cleared {
            return None;
        }
        base.get(key).cloned()
    }

    /// Returns all visible records within `range`, in key order.
    pub fn merged_range(&self, base: &StoreData, range: &KeyRange) -> BTreeMap<Key, Arc<Value>> {
        let mut merged = BTreeMap::new();
        if range.is_empty() {
            return merged;
        }
        if !self.cleared {
            for (key, record) in base.records.range(range.as_bounds()) {
                merged.insert(key.clone(), record.value.clone());
            }
        }
        for (key, change) in self.changes.range(range.as_bounds()) {
            match change {
                Change::Put { value, .. } => {
                    merged.insert(key.clone(), value.clone());
                }
                Change::Delete => {
                    merged.remove(key);
                }
            }
        }
        merged
    }

    /// Stages an insert or overwrite.
    pub fn stage_put(&mut self, key: Key, value: Arc<Value>, size: u64) {
        self.changes.insert(key, Change::Put { value, size });
    }

    /// Stages a tombstone.
    pub fn stage_delete(&mut self, key: Key) {
        self.changes.insert(key, Change::Delete);
    }

    /// Stages removal of every record.
    pub fn stage_clear(&mut self) {
        self.cleared = true;
        self.changes.clear();
    }

    /// Key generator position visible to this transaction.
    pub fn current_key_generator(&self, base: &StoreData) -> u64 {
        self.key_generator.unwrap_or(base.key_generator)
    }

    /// Returns `true` if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.changes.is_empty() && self.key_generator.is_none()
    }

    /// Merges the overlay into a copy of the committed store.
    pub fn apply_to(&self, store: &mut StoreData) {
        if self.cleared {
            store.clear();
        }
        for (key, change) in &self.changes {
            match change {
                Change::Put { value, size } => store.insert(key.clone(), value.clone(), *size),
                Change::Delete => store.remove(key),
            }
        }
        if let Some(generator) = self.key_generator {
            store.key_generator = generator;
        }
    }
}
