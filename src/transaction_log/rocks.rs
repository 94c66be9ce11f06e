use std::path::{Path, PathBuf};

use ahash::AHashMap as HashMap;
use log::{debug, info};
use rocksdb::{DB, IteratorMode, Options, WriteOptions};

use crate::errors::{MaatError, Result};
use crate::status::TransactionId;
use crate::transaction_log::{TransactionLog, TransactionLogEntry};

/// Transaction log persisted in a RocksDB database.
///
/// Keys are the 16 raw bytes of the transaction id, values are
/// bincode-encoded [`TransactionLogEntry`] rows. Every write is synced to disk
/// before returning.
pub struct RocksDbTransactionLog {
    db: DB,
    path: PathBuf,
}

impl RocksDbTransactionLog {
    /// Opens (or creates) the log stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MaatError::Log`] if the folder cannot be created or the
    /// database cannot be opened, e.g. because another process holds its lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, &path)?;

        info!("Opened transaction log at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync_writes() -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(true);
        options
    }
}

impl TransactionLog for RocksDbTransactionLog {
    fn log_status(&self, entry: &TransactionLogEntry) -> Result<()> {
        let value = bincode::serialize(entry)?;
        self.db
            .put_opt(entry.transaction_id.as_bytes(), value, &Self::sync_writes())?;
        debug!(
            "Logged {} for transaction '{}' in {}",
            entry.status,
            entry.transaction_id,
            self.path.display()
        );
        Ok(())
    }

    fn last_status(&self, transaction_id: &TransactionId) -> Result<Option<TransactionLogEntry>> {
        match self.db.get(transaction_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn last_statuses(&self) -> Result<HashMap<TransactionId, TransactionLogEntry>> {
        let mut statuses = HashMap::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            let entry: TransactionLogEntry = bincode::deserialize(&value)?;
            if key.as_ref() != entry.transaction_id.as_bytes() {
                return Err(MaatError::Log(format!(
                    "entry of transaction '{}' stored under a foreign key",
                    entry.transaction_id
                )));
            }
            statuses.insert(entry.transaction_id, entry);
        }
        Ok(statuses)
    }

    fn delete(&self, transaction_id: &TransactionId) -> Result<()> {
        self.db
            .delete_opt(transaction_id.as_bytes(), &Self::sync_writes())?;
        Ok(())
    }
}
