//! Transaction state machine, staging overlays, and atomic commit.

mod change;
mod staging_buffer;
mod state;
#[allow(clippy::module_inception)]
mod transaction;

pub use change::Change;
pub use staging_buffer::StagingBuffer;
pub use state::{TransactionMode, TransactionState};
pub use transaction::Transaction;
