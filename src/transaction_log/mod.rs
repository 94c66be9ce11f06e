//! Durable record of the last known status of every transaction.
//!
//! Each coordinator and participant owns one log, scoped by its name. Workers
//! write `X_STARTED` before and `X_FINISHED` after every resource action, and
//! the recovery sweep reads the whole log back after a restart.

pub mod memory;
#[cfg(feature = "durable")]
pub mod rocks;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap as HashMap;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::TransactionConfig;
use crate::errors::Result;
use crate::status::{TransactionId, TransactionStatus};

pub use memory::MemoryTransactionLog;
#[cfg(feature = "durable")]
pub use rocks::RocksDbTransactionLog;

/// One row of the transaction log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogEntry {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    /// False for one-phase transactions begun without a coordinator.
    pub two_phase: bool,
    /// Milliseconds since the Unix epoch of the last call on the transaction.
    pub last_accessed_ms: u64,
}

impl TransactionLogEntry {
    pub fn new(transaction_id: TransactionId, status: TransactionStatus, two_phase: bool) -> Self {
        Self {
            transaction_id,
            status,
            two_phase,
            last_accessed_ms: now_millis(),
        }
    }

    /// Time elapsed since the last access, saturating at zero for clock skew.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_accessed_ms))
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Storage of transaction statuses.
///
/// Implementations must make `log_status` durable before returning and must
/// propagate every failure, so that callers abort instead of continuing with
/// unlogged state.
pub trait TransactionLog: Send + Sync {
    /// Records `entry` as the latest status of its transaction.
    fn log_status(&self, entry: &TransactionLogEntry) -> Result<()>;

    /// Latest entry of one transaction, if it was ever logged.
    fn last_status(&self, transaction_id: &TransactionId) -> Result<Option<TransactionLogEntry>>;

    /// Latest entry of every transaction in the log.
    fn last_statuses(&self) -> Result<HashMap<TransactionId, TransactionLogEntry>>;

    /// Removes a transaction from the log.
    fn delete(&self, transaction_id: &TransactionId) -> Result<()>;
}

/// Opens the log named `name` inside the configured log folder.
///
/// With the `durable` feature this is a RocksDB database at
/// `<transaction_log_folder_path>/<name>`. Without it the log lives in memory
/// and does not survive a restart.
pub fn open_transaction_log(config: &TransactionConfig, name: &str) -> Result<Arc<dyn TransactionLog>> {
    #[cfg(feature = "durable")]
    {
        let path = config.transaction_log_folder_path.join(name);
        Ok(Arc::new(RocksDbTransactionLog::open(path)?))
    }
    #[cfg(not(feature = "durable"))]
    {
        warn!(
            "Durable transaction log disabled, log '{}' under {} is kept in memory",
            name,
            config.transaction_log_folder_path.display()
        );
        Ok(Arc::new(MemoryTransactionLog::new()))
    }
}

/// Writes `next` for `transaction_id` after checking the status graph.
///
/// `current` is updated only after the write succeeded.
pub(crate) fn advance(
    log: &dyn TransactionLog,
    transaction_id: TransactionId,
    current: &mut TransactionStatus,
    next: TransactionStatus,
    two_phase: bool,
) -> Result<()> {
    if !current.can_advance_to(next, two_phase) {
        warn!(
            "Refusing to log {} after {} for transaction '{}'",
            next, current, transaction_id
        );
        return Err(crate::errors::MaatError::IllegalTransition {
            id: transaction_id,
            from: *current,
            to: next,
        });
    }
    log.log_status(&TransactionLogEntry::new(transaction_id, next, two_phase))?;
    *current = next;
    Ok(())
}
