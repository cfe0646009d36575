//! On-disk formats for persisted databases.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::Snapshot;
use crate::error::Result;
use crate::key::Key;
use crate::object_store::{StoreData, StoreParameters};

/// Current manifest and image format version.
pub const FORMAT_VERSION: u32 = 1;

/// Index of persisted databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version
    pub format_version: u32,
    /// Entries by database name
    pub databases: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            databases: BTreeMap::new(),
        }
    }
}

/// Manifest entry for one database image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Image file name relative to the data directory
    pub file: String,
    /// Committed schema version stored in the image
    pub version: u64,
    /// Bumped on every save; part of the file name
    pub generation: u64,
    /// CRC32 of the image bytes
    pub checksum: u32,
}

/// Full contents of one database.
#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseImage {
    /// Database name
    pub name: String,
    /// Committed schema version
    pub version: u64,
    /// Object stores in name order
    pub stores: Vec<StoreImage>,
}

/// Contents of one object store.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreImage {
    /// Store name
    pub name: String,
    /// Creation parameters
    pub params: StoreParameters,
    /// Next generated key
    pub key_generator: u64,
    /// Records in key order
    pub records: Vec<(Key, Value)>,
}

impl DatabaseImage {
    /// Captures a committed snapshot.
    pub fn from_snapshot(name: &str, snapshot: &Snapshot) -> Self {
        let stores = snapshot
            .stores
            .values()
            .map(|store| StoreImage {
                name: store.name.clone(),
                params: store.params.clone(),
                key_generator: store.key_generator,
                records: store
                    .records
                    .iter()
                    .map(|(key, record)| (key.clone(), Value::clone(&record.value)))
                    .collect(),
            })
            .collect();
        Self {
            name: name.to_string(),
            version: snapshot.version,
            stores,
        }
    }

    /// Rebuilds a snapshot, recomputing record sizes.
    pub fn into_snapshot(self) -> Result<Snapshot> {
        let mut stores = BTreeMap::new();
        for image in self.stores {
            let data = StoreData::from_records(
                image.name.clone(),
                image.params,
                image.key_generator,
                image.records,
            )?;
            stores.insert(image.name, Arc::new(data));
        }
        Ok(Snapshot {
            version: self.version,
            stores,
        })
    }
}

/// Image file name for one saved generation of a database. Names are
/// hex-encoded so any string maps to a valid file name.
pub fn image_file_name(name: &str, generation: u64) -> String {
    format!("db-{}-{}.json", hex::encode(name.as_bytes()), generation)
}

/// Returns `true` for file names produced by [`image_file_name`].
pub fn is_image_file(file_name: &str) -> bool {
    file_name.starts_with("db-") && file_name.ends_with(".json")
}
