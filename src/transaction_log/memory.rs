use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::errors::Result;
use crate::status::{TransactionId, TransactionStatus};
use crate::transaction_log::{TransactionLog, TransactionLogEntry};

/// In-memory transaction log.
///
/// Keeps the latest entry per transaction plus the full append history, which
/// makes status walks observable in tests. Share it through an `Arc` across a
/// simulated restart to model a log that survived the crash.
#[derive(Debug, Default)]
pub struct MemoryTransactionLog {
    latest: RwLock<HashMap<TransactionId, TransactionLogEntry>>,
    history: RwLock<Vec<TransactionLogEntry>>,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status ever logged for `transaction_id`, oldest first.
    pub fn history(&self, transaction_id: &TransactionId) -> Vec<TransactionStatus> {
        self.history
            .read()
            .iter()
            .filter(|entry| entry.transaction_id == *transaction_id)
            .map(|entry| entry.status)
            .collect()
    }

    /// Overwrites the last access time of a transaction, e.g. to age it in tests.
    pub fn set_last_accessed_ms(&self, transaction_id: &TransactionId, last_accessed_ms: u64) {
        if let Some(entry) = self.latest.write().get_mut(transaction_id) {
            entry.last_accessed_ms = last_accessed_ms;
        }
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn log_status(&self, entry: &TransactionLogEntry) -> Result<()> {
        self.history.write().push(entry.clone());
        self.latest.write().insert(entry.transaction_id, entry.clone());
        Ok(())
    }

    fn last_status(&self, transaction_id: &TransactionId) -> Result<Option<TransactionLogEntry>> {
        Ok(self.latest.read().get(transaction_id).cloned())
    }

    fn last_statuses(&self) -> Result<HashMap<TransactionId, TransactionLogEntry>> {
        Ok(self.latest.read().clone())
    }

    fn delete(&self, transaction_id: &TransactionId) -> Result<()> {
        self.latest.write().remove(transaction_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_latest_and_history() {
        let log = MemoryTransactionLog::new();
        let id = TransactionId::new();
        let other = TransactionId::new();

        log.log_status(&TransactionLogEntry::new(id, TransactionStatus::BeginStarted, true))
            .unwrap();
        log.log_status(&TransactionLogEntry::new(other, TransactionStatus::BeginStarted, false))
            .unwrap();
        log.log_status(&TransactionLogEntry::new(id, TransactionStatus::BeginFinished, true))
            .unwrap();

        assert_eq!(
            log.history(&id),
            vec![TransactionStatus::BeginStarted, TransactionStatus::BeginFinished]
        );
        assert_eq!(log.last_statuses().unwrap().len(), 2);

        log.delete(&id).unwrap();
        assert!(log.last_status(&id).unwrap().is_none());
        assert!(!log.last_status(&other).unwrap().unwrap().two_phase);
    }
}
