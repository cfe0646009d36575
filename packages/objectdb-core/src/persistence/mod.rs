//! Durable database images and the manifest that indexes them.
//!
//! Every committed snapshot is written to a JSON image file of a new
//! generation, then the manifest entry (version, generation, CRC32) is
//! switched to it and the previous generation is deleted. Both writes go
//! through a synced temporary file and an atomic rename, so the manifest
//! always names a complete image.


pub mod image;
pub mod io_utils;
mod persistence_manager;

pub use image::{DatabaseImage, Manifest, ManifestEntry, StoreImage, FORMAT_VERSION};
pub use persistence_manager::PersistenceManager;
