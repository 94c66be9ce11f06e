use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::errors::{MaatError, Result};
use crate::operation::OperationRegistry;
use crate::provider::ResourceProvider;
use crate::status::TransactionId;

/// A staged change of one key.
#[derive(Debug, Clone, PartialEq)]
enum Write {
    Insert(Value),
    /// Insert over a row deleted earlier in the same transaction.
    Replace(Value),
    Delete,
}

#[derive(Debug, Default)]
struct Tables {
    committed: RwLock<BTreeMap<String, Value>>,
    prepared: Mutex<HashMap<TransactionId, BTreeMap<String, Write>>>,
    rollbacks: AtomicUsize,
}

/// Key/value database with prepared-transaction support.
///
/// Clones share the same tables, so a clone handed to a participant created
/// after a simulated crash sees the committed rows and the prepared
/// transactions of the previous incarnation, the way a real database
/// outlives the process talking to it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Tables>,
}

/// Open transaction of a [`MemoryDatabase`]. Writes stay private until commit.
#[derive(Debug)]
pub struct MemoryTransaction {
    transaction_id: TransactionId,
    tables: Arc<Tables>,
    writes: BTreeMap<String, Write>,
}

impl MemoryTransaction {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Inserts a new row. Fails if the key is visible to this transaction.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.get(&key).is_some() {
            return Err(MaatError::Resource(format!("duplicate key '{key}'")));
        }
        let write = match self.writes.get(&key) {
            Some(Write::Delete) => Write::Replace(value),
            _ => Write::Insert(value),
        };
        self.writes.insert(key, write);
        Ok(())
    }

    /// Row as seen by this transaction, including its own uncommitted writes.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.writes.get(key) {
            Some(Write::Insert(value) | Write::Replace(value)) => Some(value.clone()),
            Some(Write::Delete) => None,
            None => self.tables.committed.read().get(key).cloned(),
        }
    }

    /// Deletes a row. Returns whether it existed.
    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.get(key).is_some();
        if existed {
            self.writes.insert(key.to_string(), Write::Delete);
        }
        existed
    }

    /// Number of rows visible to this transaction.
    pub fn count(&self) -> usize {
        let committed = self.tables.committed.read();
        let mut count = committed.len();
        for (key, write) in &self.writes {
            match (write, committed.contains_key(key)) {
                (Write::Insert(_) | Write::Replace(_), false) => count += 1,
                (Write::Delete, true) => count -= 1,
                _ => {}
            }
        }
        count
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.tables.committed.read().get(key).cloned()
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.tables.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the transactions prepared but not yet finished.
    pub fn prepared_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.tables.prepared.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of resource-level rollbacks performed, counting only
    /// `rollback_prepared_transaction` calls that found a prepared transaction.
    pub fn rollback_count(&self) -> usize {
        self.tables.rollbacks.load(Ordering::SeqCst)
    }

    /// Registry of the operations every [`MemoryDatabase`] participant offers:
    /// `insert(key, value)`, `get(key)`, `delete(key)` and `count()`.
    pub fn operations() -> OperationRegistry<MemoryTransaction> {
        let mut registry = OperationRegistry::new();
        registry
            .register(
                "insert",
                |tx: &mut MemoryTransaction, (key, value): (String, Value)| tx.insert(key, value),
            )
            .register("get", |tx: &mut MemoryTransaction, (key,): (String,)| {
                Ok(tx.get(&key))
            })
            .register("delete", |tx: &mut MemoryTransaction, (key,): (String,)| {
                Ok(tx.delete(&key))
            })
            .register("count", |tx: &mut MemoryTransaction, (): ()| Ok(tx.count()));
        registry
    }

    fn check_constraints(&self, writes: &BTreeMap<String, Write>) -> Result<()> {
        let committed = self.tables.committed.read();
        for (key, write) in writes {
            if matches!(write, Write::Insert(_)) && committed.contains_key(key) {
                return Err(MaatError::Resource(format!(
                    "duplicate key '{key}' committed concurrently"
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, writes: BTreeMap<String, Write>) {
        let mut committed = self.tables.committed.write();
        for (key, write) in writes {
            match write {
                Write::Insert(value) | Write::Replace(value) => {
                    committed.insert(key, value);
                }
                Write::Delete => {
                    committed.remove(&key);
                }
            }
        }
    }
}

impl ResourceProvider for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn begin_transaction(&self, transaction_id: TransactionId) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            transaction_id,
            tables: Arc::clone(&self.tables),
            writes: BTreeMap::new(),
        })
    }

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> Result<()> {
        self.check_constraints(&transaction.writes)?;
        let mut prepared = self.tables.prepared.lock();
        if prepared.contains_key(&transaction_id) {
            return Err(MaatError::Resource(format!(
                "transaction '{transaction_id}' is already prepared"
            )));
        }
        prepared.insert(transaction_id, std::mem::take(&mut transaction.writes));
        debug!("Prepared transaction '{}'", transaction_id);
        Ok(())
    }

    fn commit_prepared_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let writes = self
            .tables
            .prepared
            .lock()
            .remove(&transaction_id)
            .ok_or_else(|| {
                MaatError::Resource(format!("no prepared transaction '{transaction_id}'"))
            })?;
        self.apply(writes);
        debug!("Committed prepared transaction '{}'", transaction_id);
        Ok(())
    }

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> Result<()> {
        transaction.writes.clear();
        self.tables.rollbacks.fetch_add(1, Ordering::SeqCst);
        debug!("Rolled back transaction '{}'", transaction_id);
        Ok(())
    }

    fn rollback_prepared_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        if self.tables.prepared.lock().remove(&transaction_id).is_some() {
            self.tables.rollbacks.fetch_add(1, Ordering::SeqCst);
            debug!("Rolled back prepared transaction '{}'", transaction_id);
        }
        Ok(())
    }

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> Result<()> {
        self.check_constraints(&transaction.writes)?;
        self.apply(std::mem::take(&mut transaction.writes));
        debug!("Committed transaction '{}'", transaction_id);
        Ok(())
    }
}
