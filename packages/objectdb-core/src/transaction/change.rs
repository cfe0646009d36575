use std::sync::Arc;

use serde_json::Value;

/// A buffered effect on a single key.
#[derive(Debug, Clone)]
pub enum Change {
    /// Insert or overwrite the record
    Put {
        /// New record value
        value: Arc<Value>,
        /// Serialized key + value size
        size: u64,
    },
    /// Remove the record (tombstone)
    Delete,
}

impl Change {
    /// Value visible through this change, if any.
    pub fn value(&self) -> Option<&Arc<Value>> {
        match self {
            Change::Put { value, .. } => Some(value),
            Change::Delete => None,
        }
    }
}
