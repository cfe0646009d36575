//! I/O utilities for persistence operations.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::DbError;

/// Classifies I/O errors into specific DbError variants.
pub fn classify_io_error(error: std::io::Error, context: &str) -> DbError {
    match error.kind() {
        ErrorKind::StorageFull | ErrorKind::OutOfMemory => {
            DbError::DiskFull(format!("{}: {}", context, error))
        }
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
            DbError::TransientIoError(format!("{}: {}", context, error))
        }
        _ => DbError::IoError(format!("{}: {}", context, error)),
    }
}

/// Retries an operation that may fail with transient I/O errors.
pub fn retry_io_operation<F, T>(
    operation: F,
    max_retries: u32,
    retry_delay_ms: u64,
    context: &str,
) -> Result<T, DbError>
where
    F: Fn() -> Result<T, DbError>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(DbError::TransientIoError(msg)) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Transient I/O error in {} (attempt {}/{}): {}",
                    context,
                    attempt,
                    max_retries,
                    msg
                );
                if retry_delay_ms > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(retry_delay_ms));
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Writes `bytes` to `path` via a synced temporary file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DbError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| classify_io_error(e, "Failed to create data directory"))?;
    }
    let temp_path = path.with_extension("json.tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| classify_io_error(e, "Failed to create temp file"))?;
    file.write_all(bytes)
        .map_err(|e| classify_io_error(e, "Failed to write temp file"))?;
    file.sync_all()
        .map_err(|e| classify_io_error(e, "Failed to sync temp file"))?;

    fs::rename(&temp_path, path).map_err(|e| classify_io_error(e, "Failed to rename temp file"))
}

/// Contents of a file read for loading.
#[derive(Debug)]
pub enum FileBytes {
    /// Read into memory
    Owned(Vec<u8>),
    /// Read-only memory map of the file
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl std::ops::Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Owned(bytes) => bytes,
            #[cfg(feature = "mmap")]
            FileBytes::Mapped(mmap) => mmap,
        }
    }
}

/// Reads a whole file.
#[cfg(not(feature = "mmap"))]
pub fn read_file(path: &Path) -> Result<FileBytes, DbError> {
    fs::read(path)
        .map(FileBytes::Owned)
        .map_err(|e| classify_io_error(e, "Failed to read file"))
}

/// Maps a whole file read-only; callers parse straight from the mapping.
#[cfg(feature = "mmap")]
pub fn read_file(path: &Path) -> Result<FileBytes, DbError> {
    let file = File::open(path).map_err(|e| classify_io_error(e, "Failed to open file"))?;
    let len = file
        .metadata()
        .map_err(|e| classify_io_error(e, "Failed to stat file"))?
        .len();
    if len == 0 {
        return Ok(FileBytes::Owned(Vec::new()));
    }
    // SAFETY: the file is opened read-only and image files are written once
    // under a fresh generation name, never modified in place.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| classify_io_error(e, "Failed to map file"))?;
    Ok(FileBytes::Mapped(mmap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use tempfile::tempdir;

    #[timeout(1000)]
    #[test]
    fn test_read_file_returns_written_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db-00-1.json");
        write_atomic(&path, b"{\"name\":\"x\"}").unwrap();
        let bytes = read_file(&path).unwrap();
        assert_eq!(&bytes[..], b"{\"name\":\"x\"}");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["name"], "x");

        let empty = dir.path().join("empty.json");
        fs::write(&empty, b"").unwrap();
        assert!(read_file(&empty).unwrap().is_empty());
    }

    #[timeout(1000)]
    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = read_file(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(DbError::IoError(_))));
    }
}
