//! Engine configuration.

use std::path::PathBuf;

/// What `delete_database` does while connections are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Fail immediately with `DatabaseBusy`
    #[default]
    Error,
    /// Wait until every connection has closed
    Block,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Data directory for persistence (`None` keeps everything in memory)
    pub data_dir: Option<PathBuf>,
    /// Origin-wide storage quota in bytes
    pub quota_bytes: u64,
    /// Behaviour of database deletion while connections are open
    pub delete_policy: DeletePolicy,
    /// Maximum requests executed per transaction per tick
    pub max_requests_per_tick: usize,
    /// Fixed accounting overhead charged per database
    pub database_overhead_bytes: u64,
    /// Fixed accounting overhead charged per object store
    pub store_overhead_bytes: u64,
    /// Maximum retry attempts for transient I/O errors
    pub persistence_max_retries: u32,
    /// Delay between retry attempts in milliseconds
    pub persistence_retry_delay_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            quota_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            delete_policy: DeletePolicy::Error,
            max_requests_per_tick: 1024,
            database_overhead_bytes: 256,
            store_overhead_bytes: 128,
            persistence_max_retries: 3,      // Default retry attempts
            persistence_retry_delay_ms: 100, // 100ms delay between retries
        }
    }
}

impl DbConfig {
    /// Configuration persisting into `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }
}
