//! Persistence manager for database images.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::DbConfig;
use crate::database::Snapshot;
use crate::error::DbError;

use super::image::{image_file_name, is_image_file, DatabaseImage, Manifest, ManifestEntry, FORMAT_VERSION};
use super::io_utils::{classify_io_error, read_file, retry_io_operation, write_atomic};

const MANIFEST_FILE: &str = "manifest.json";

/// Writes and loads database images under one data directory.
#[derive(Debug)]
pub struct PersistenceManager {
    /// Data directory path
    data_dir: PathBuf,
    /// In-memory copy of the manifest on disk
    manifest: Mutex<Manifest>,
    /// Maximum retry attempts for transient I/O errors
    max_retries: u32,
    /// Delay between retry attempts in milliseconds
    retry_delay_ms: u64,
}

impl PersistenceManager {
    /// Creates a manager for the configured data directory, or `None` when
    /// the engine runs in memory only.
    pub fn from_config(config: &DbConfig) -> Result<Option<Self>, DbError> {
        match &config.data_dir {
            Some(dir) => Self::open(dir.clone(), config).map(Some),
            None => Ok(None),
        }
    }

    /// Opens `data_dir`, reading the manifest if one exists.
    pub fn open(data_dir: PathBuf, config: &DbConfig) -> Result<Self, DbError> {
        let manifest = read_manifest(&data_dir)?;
        Ok(Self {
            data_dir,
            manifest: Mutex::new(manifest),
            max_retries: config.persistence_max_retries,
            retry_delay_ms: config.persistence_retry_delay_ms,
        })
    }

    /// Returns the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns a copy of the current manifest.
    pub fn manifest(&self) -> Result<Manifest, DbError> {
        let manifest = self.manifest.lock().map_err(|_| DbError::LockPoisoned)?;
        Ok(manifest.clone())
    }

    /// Writes the image of `snapshot` and points the manifest at it.
    ///
    /// Each save goes to a new generation file, so the image the manifest
    /// currently names is never overwritten. The previous generation is
    /// deleted once the manifest points at the new one; if the manifest
    /// write fails the new file is deleted instead.
    ///
    /// # Arguments
    /// * `name` - Database name
    /// * `snapshot` - Snapshot about to be published
    ///
    /// # Returns
    /// `Result<(), DbError>` indicating success or failure.
    pub fn save_database(&self, name: &str, snapshot: &Snapshot) -> Result<(), DbError> {
        let image = DatabaseImage::from_snapshot(name, snapshot);
        let bytes =
            serde_json::to_vec(&image).map_err(|e| DbError::Serialization(e.to_string()))?;

        let previous = self.manifest()?.databases.get(name).cloned();
        let generation = previous.as_ref().map_or(1, |entry| entry.generation + 1);
        let file = image_file_name(name, generation);
        let path = self.data_dir.join(&file);

        retry_io_operation(
            || write_atomic(&path, &bytes),
            self.max_retries,
            self.retry_delay_ms,
            "save_database",
        )?;

        let entry = ManifestEntry {
            file: file.clone(),
            version: snapshot.version,
            generation,
            checksum: crc32fast::hash(&bytes),
        };
        if let Err(e) = self.update_manifest(|manifest| {
            manifest.databases.insert(name.to_string(), entry);
        }) {
            self.discard_image(&file);
            return Err(e);
        }

        if let Some(previous) = previous {
            self.discard_image(&previous.file);
        }
        tracing::debug!(
            "Persisted database '{}' at version {} as {} ({} bytes)",
            name,
            snapshot.version,
            file,
            bytes.len()
        );
        Ok(())
    }

    /// Deletes image files the manifest does not reference, left behind by
    /// a crash between writing an image and updating the manifest.
    ///
    /// Returns the number of files removed.
    pub fn remove_orphaned_images(&self) -> Result<usize, DbError> {
        let referenced: Vec<String> = self
            .manifest()?
            .databases
            .into_values()
            .map(|entry| entry.file)
            .collect();

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(classify_io_error(e, "Failed to list data directory")),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| classify_io_error(e, "Failed to list data directory"))?;
            let Some(file) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_image_file(&file) && !referenced.contains(&file) {
                self.discard_image(&file);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("Removed {} orphaned image(s)", removed);
        }
        Ok(removed)
    }

    /// Best-effort removal of an image that is no longer referenced.
    fn discard_image(&self, file: &str) {
        match std::fs::remove_file(self.data_dir.join(file)) {
            Ok(()) => tracing::debug!("Removed image {}", file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove image {}: {}", file, e),
        }
    }

    /// Removes a database from the manifest and deletes its image.
    pub fn remove_database(&self, name: &str) -> Result<(), DbError> {
        let mut removed = None;
        self.update_manifest(|manifest| {
            removed = manifest.databases.remove(name);
        })?;

        if let Some(entry) = removed {
            let path = self.data_dir.join(&entry.file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(classify_io_error(e, "Failed to remove database image")),
            }
            tracing::debug!("Removed persisted database '{}'", name);
        }
        Ok(())
    }

    /// Loads every database listed in the manifest.
    ///
    /// Images whose checksum or version disagrees with the manifest are
    /// reported as `DataCorruption`.
    pub fn load_all(&self) -> Result<Vec<(String, Snapshot)>, DbError> {
        let manifest = self.manifest()?;
        let mut loaded = Vec::with_capacity(manifest.databases.len());

        for (name, entry) in manifest.databases {
            let path = self.data_dir.join(&entry.file);
            let bytes = retry_io_operation(
                || read_file(&path),
                self.max_retries,
                self.retry_delay_ms,
                "load_database",
            )?;

            let actual = crc32fast::hash(&bytes);
            if actual != entry.checksum {
                return Err(DbError::DataCorruption(format!(
                    "Checksum mismatch for database '{}': expected {:08x}, got {:08x}",
                    name, entry.checksum, actual
                )));
            }

            let image: DatabaseImage = serde_json::from_slice(&bytes)
                .map_err(|e| DbError::DataCorruption(format!("{}: {}", entry.file, e)))?;
            if image.name != name || image.version != entry.version {
                return Err(DbError::DataCorruption(format!(
                    "Image {} does not match manifest entry for '{}'",
                    entry.file, name
                )));
            }

            let snapshot = image.into_snapshot()?;
            tracing::info!(
                "Loaded database '{}' at version {} with {} stores",
                name,
                snapshot.version,
                snapshot.stores.len()
            );
            loaded.push((name, snapshot));
        }

        Ok(loaded)
    }

    fn update_manifest<F>(&self, edit: F) -> Result<(), DbError>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut manifest = self.manifest.lock().map_err(|_| DbError::LockPoisoned)?;
        let mut next = manifest.clone();
        edit(&mut next);

        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let path = self.data_dir.join(MANIFEST_FILE);
        retry_io_operation(
            || write_atomic(&path, &bytes),
            self.max_retries,
            self.retry_delay_ms,
            "write_manifest",
        )?;

        *manifest = next;
        Ok(())
    }
}

fn read_manifest(data_dir: &Path) -> Result<Manifest, DbError> {
    let path = data_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(Manifest::default());
    }
    let bytes = std::fs::read(&path).map_err(|e| classify_io_error(e, "Failed to read manifest"))?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|e| DbError::DataCorruption(format!("{}: {}", MANIFEST_FILE, e)))?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(DbError::DataCorruption(format!(
            "Unsupported manifest format version {}",
            manifest.format_version
        )));
    }
    Ok(manifest)
}
