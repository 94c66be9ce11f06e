use crate::errors::Result;
use crate::status::TransactionId;

/// Resource-level transaction primitives of one physical resource manager,
/// typically one database.
///
/// The worker of a transaction is the only caller for its id, so
/// implementations never see two calls for the same transaction at once. A
/// handle is dropped by the worker once the action that consumed it
/// (prepare, commit or rollback) succeeded. A failed action keeps the handle
/// so that the call can be retried.
///
/// Prepared transactions must be kept by the resource under their id and
/// survive a restart of the participant process, which is what allows
/// `commit_prepared_transaction` and `rollback_prepared_transaction` to be
/// driven from the transaction log alone.
pub trait ResourceProvider: Send + Sync + 'static {
    /// Native transaction handle, e.g. a database connection in a transaction.
    type Transaction: Send + 'static;

    /// Opens a new resource transaction for `transaction_id`.
    fn begin_transaction(&self, transaction_id: TransactionId) -> Result<Self::Transaction>;

    /// Flushes pending work and durably marks the transaction as prepared.
    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut Self::Transaction,
    ) -> Result<()>;

    /// Finalizes a transaction that was prepared earlier.
    fn commit_prepared_transaction(&self, transaction_id: TransactionId) -> Result<()>;

    /// Aborts a transaction that was never prepared.
    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut Self::Transaction,
    ) -> Result<()>;

    /// Undoes a prepared, uncommitted transaction.
    ///
    /// Must succeed without effect when nothing is prepared under
    /// `transaction_id`, since recovery calls it whenever a prepare may have
    /// happened.
    fn rollback_prepared_transaction(&self, transaction_id: TransactionId) -> Result<()>;

    /// Commits a one-phase transaction directly from its open handle.
    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut Self::Transaction,
    ) -> Result<()>;
}
