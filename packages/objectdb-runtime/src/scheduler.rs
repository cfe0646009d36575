//! Admission policy for concurrently open transactions.
//!
//! Two transactions on the same database conflict when either is a version
//! change, or when their scopes overlap and at least one of them writes.
//! A transaction is admitted once no earlier live transaction on the same
//! database conflicts with it.

use std::collections::BTreeSet;

use objectdb_core::transaction::TransactionMode;

/// What the scheduler needs to know about a transaction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Claim<'a> {
    pub(crate) database: &'a str,
    pub(crate) mode: TransactionMode,
    pub(crate) scope: &'a BTreeSet<String>,
}

/// Returns `true` if `a` and `b` may not run concurrently.
pub(crate) fn conflicts(a: &Claim<'_>, b: &Claim<'_>) -> bool {
    if a.database != b.database {
        return false;
    }
    if a.mode == TransactionMode::VersionChange || b.mode == TransactionMode::VersionChange {
        return true;
    }
    if !a.mode.can_write() && !b.mode.can_write() {
        return false;
    }
    a.scope.intersection(b.scope).next().is_some()
}

/// Returns `true` if `candidate` may start given the earlier live
/// transactions in admission order.
pub(crate) fn can_admit<'a, I>(candidate: &Claim<'_>, earlier: I) -> bool
where
    I: IntoIterator<Item = Claim<'a>>,
{
    earlier
        .into_iter()
        .all(|other| !conflicts(candidate, &other))
}
