//! Database error types.

use thiserror::Error;

/// Database operation errors.
///
/// Errors are `Clone` so a single failure can be recorded on a request,
/// on its transaction, and handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    /// Operation invalid for the current transaction or database state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Request issued against a transaction that is not active
    #[error("Transaction {txn} is not active")]
    TransactionInactive { txn: u64 },

    /// Uniqueness violation or duplicate schema object
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Operation outside the transaction's declared scope
    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    /// Request failed because its transaction aborted
    #[error("Transaction {txn} aborted")]
    Abort { txn: u64 },

    /// Write attempted on a readonly transaction
    #[error("Transaction {txn} is read-only")]
    ReadOnly { txn: u64 },

    /// Invalid key or key-path evaluation failure
    #[error("Data error: {0}")]
    Data(String),

    /// Requested version is lower than the stored version
    #[error("Requested version {requested} is lower than current version {current} of '{database}'")]
    Version {
        database: String,
        requested: u64,
        current: u64,
    },

    /// Named object store does not exist
    #[error("Object store '{store}' not found")]
    NotFound { store: String },

    /// Database still has open connections
    #[error("Database '{database}' has {connections} open connection(s)")]
    DatabaseBusy { database: String, connections: usize },

    /// Commit would push usage above the configured quota
    #[error("Quota exceeded: requested {requested} bytes, quota {quota} bytes")]
    QuotaExceeded { requested: u64, quota: u64 },

    /// Lock poisoned (RwLock poisoned)
    #[error("Lock poisoned")]
    LockPoisoned,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    /// Disk full error during persistence
    #[error("Disk full: {0}")]
    DiskFull(String),

    /// I/O error during persistence
    #[error("I/O error: {0}")]
    IoError(String),

    /// Transient I/O error that may succeed on retry
    #[error("Transient I/O error: {0}")]
    TransientIoError(String),
}

impl DbError {
    /// Stable error name, matching the names callers test against.
    pub fn name(&self) -> &'static str {
        match self {
            DbError::InvalidState(_) => "InvalidStateError",
            DbError::TransactionInactive { .. } => "TransactionInactiveError",
            DbError::Constraint(_) => "ConstraintError",
            DbError::InvalidAccess(_) => "InvalidAccessError",
            DbError::Abort { .. } => "AbortError",
            DbError::ReadOnly { .. } => "ReadOnlyError",
            DbError::Data(_) => "DataError",
            DbError::Version { .. } => "VersionError",
            DbError::NotFound { .. } => "NotFoundError",
            DbError::DatabaseBusy { .. } => "DatabaseBusyError",
            DbError::QuotaExceeded { .. } => "QuotaExceededError",
            DbError::LockPoisoned
            | DbError::Serialization(_)
            | DbError::DataCorruption(_)
            | DbError::DiskFull(_)
            | DbError::IoError(_)
            | DbError::TransientIoError(_) => "UnknownError",
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, DbError>;
