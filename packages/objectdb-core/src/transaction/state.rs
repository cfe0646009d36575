//! Transaction modes and lifecycle states.

use std::fmt;

/// Access mode declared when a transaction is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Reads only
    ReadOnly,
    /// Reads and record writes
    ReadWrite,
    /// Exclusive schema upgrade
    VersionChange,
}

impl TransactionMode {
    /// Returns `true` if the mode may write records.
    pub fn can_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }

    /// Returns the mode's canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
            TransactionMode::VersionChange => "versionchange",
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transaction.
///
/// ```text
/// active ──► inactive ──► committing ──► committed
///   │  ▲        │              │
///   │  └────────┘ (dispatch)   │
///   ├──────────────────────────┤
///   └───────► aborted ◄────────┘ (merge failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Accepts new requests
    Active,
    /// Issuing context has yielded; no new requests
    Inactive,
    /// Commit requested; draining the queue
    Committing,
    /// Effects merged (terminal)
    Committed,
    /// Effects discarded (terminal)
    Aborted,
}

impl TransactionState {
    /// Returns `true` for `Committed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    /// Returns the state's canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Inactive => "inactive",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
