//! The participant side of a distributed transaction.
//!
//! A [`TransactionParticipant`] fronts one resource manager. It checks every
//! incoming call (session token, interactive session key, coordinator key and
//! transaction ownership), then routes it to the [`TransactionWorker`] of the
//! transaction. The worker map is guarded by one coarse lock that is only held
//! for insertion, lookup and removal, never while a worker runs.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::TransactionConfig;
use crate::errors::{MaatError, Result};
use crate::operation::OperationExecutor;
use crate::provider::ResourceProvider;
use crate::recovery::Recoverable;
use crate::session::SessionTokenProvider;
use crate::status::{TransactionId, TransactionStatus};
use crate::transaction_log::TransactionLog;
use crate::worker::{Admission, TransactionWorker, WorkerState};

/// How long coordinator-driven recovery calls wait for a running call.
const RECOVERY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations a participant exposes to its coordinator.
///
/// Transport-agnostic: the coordinator talks to local participants directly
/// and to remote ones through an adapter implementing this trait.
pub trait Participant: Send + Sync {
    /// Stable id the coordinator routes operations by.
    fn participant_id(&self) -> &str;

    /// Begins `transaction_id`. With a coordinator key the transaction is
    /// two-phase, without one it commits in one phase.
    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()>;

    /// Runs the named operation inside the transaction. Arguments are positional.
    fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation_name: &str,
        operation_arguments: Vec<Value>,
    ) -> Result<Value>;

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    /// Commits on behalf of a recovering coordinator that has no session.
    fn commit_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    /// Rolls back. Unknown ids are a no-op, finished ones an
    /// [`MaatError::AlreadyFinished`] error.
    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    /// Rolls back on behalf of a recovering coordinator that has no session.
    fn rollback_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    /// Ids of the unfinished transactions this participant currently tracks.
    fn get_transactions(&self, coordinator_key: &str) -> Result<Vec<TransactionId>>;

    /// Ids of the prepared transactions waiting for a coordinator decision.
    fn recover_transactions(
        &self,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<Vec<TransactionId>>;
}

struct Tracked {
    worker: Arc<TransactionWorker>,
    /// Session that began the transaction. `None` for transactions recovered from the log.
    owner: Option<String>,
}

/// Participant backed by the resource provider `P`.
pub struct TransactionParticipant<P: ResourceProvider> {
    participant_id: String,
    config: TransactionConfig,
    provider: Arc<P>,
    operations: Arc<dyn OperationExecutor<P::Transaction>>,
    sessions: Arc<dyn SessionTokenProvider>,
    log: Arc<dyn TransactionLog>,
    transactions: Mutex<HashMap<TransactionId, Tracked>>,
}

impl<P: ResourceProvider> TransactionParticipant<P> {
    /// Creates a participant.
    ///
    /// # Arguments
    ///
    /// * `participant_id` - Stable id, also the name of the participant's log.
    /// * `config` - Keys, limits and timeouts shared with the coordinator.
    /// * `provider` - The resource manager transactions run against.
    /// * `operations` - Named operations callable through `execute_operation`.
    /// * `sessions` - Validity check of session tokens.
    /// * `log` - The participant's own transaction log.
    ///
    /// # Errors
    ///
    /// [`MaatError::Disabled`] if transactions are switched off and
    /// [`MaatError::Config`] for an invalid configuration.
    pub fn new(
        participant_id: impl Into<String>,
        config: &TransactionConfig,
        provider: Arc<P>,
        operations: Arc<dyn OperationExecutor<P::Transaction>>,
        sessions: Arc<dyn SessionTokenProvider>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        let participant_id = participant_id.into();
        if participant_id.trim().is_empty() {
            return Err(MaatError::Config("participant id is blank".into()));
        }
        info!("Starting transaction participant '{}'", participant_id);
        Ok(Self {
            participant_id,
            config: config.clone(),
            provider,
            operations,
            sessions,
            log,
            transactions: Mutex::new(HashMap::new()),
        })
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Number of transactions with a live worker.
    pub fn live_transaction_count(&self) -> usize {
        self.transactions
            .lock()
            .values()
            .filter(|tracked| !tracked.worker.is_finished())
            .count()
    }

    /// Worker state of a tracked transaction.
    pub fn transaction_state(&self, transaction_id: &TransactionId) -> Option<WorkerState> {
        self.transactions
            .lock()
            .get(transaction_id)
            .map(|tracked| tracked.worker.state())
    }

    /// Last status logged for `transaction_id`, tracked or not.
    pub fn transaction_status(&self, transaction_id: &TransactionId) -> Result<Option<TransactionStatus>> {
        Ok(self.log.last_status(transaction_id)?.map(|entry| entry.status))
    }

    /// Removes finished transactions from the log.
    pub fn purge_finished_transactions(&self) -> Result<usize> {
        let mut purged = 0;
        for (transaction_id, entry) in self.log.last_statuses()? {
            if entry.status.is_terminal() {
                self.log.delete(&transaction_id)?;
                purged += 1;
            }
        }
        debug!(
            "Participant '{}' purged {} finished transactions",
            self.participant_id, purged
        );
        Ok(purged)
    }

    /// Stops every worker. Open transactions keep their logged status and are
    /// resolved by recovery on the next start.
    pub fn close(&self) {
        let workers: Vec<Arc<TransactionWorker>> = self
            .transactions
            .lock()
            .drain()
            .map(|(_, tracked)| tracked.worker)
            .collect();
        info!(
            "Closing transaction participant '{}' with {} open transactions",
            self.participant_id,
            workers.len()
        );
        for worker in workers {
            worker.shutdown();
        }
    }

    fn check_session_token(&self, session_token: &str) -> Result<()> {
        if session_token.trim().is_empty() || !self.sessions.is_valid(session_token) {
            return Err(MaatError::InvalidSessionToken);
        }
        Ok(())
    }

    fn check_interactive_session_key(&self, interactive_session_key: &str) -> Result<()> {
        if interactive_session_key != self.config.interactive_session_key {
            return Err(MaatError::InvalidInteractiveSessionKey);
        }
        Ok(())
    }

    /// A blank key is left to the worker, which rejects it as a missing secret.
    fn check_coordinator_key(&self, coordinator_key: &str) -> Result<()> {
        if !coordinator_key.trim().is_empty() && coordinator_key != self.config.coordinator_key {
            return Err(MaatError::InvalidCoordinatorKey);
        }
        Ok(())
    }

    fn check_coordinator_key_present(&self, coordinator_key: &str) -> Result<()> {
        if coordinator_key.trim().is_empty() {
            return Err(MaatError::MissingCoordinatorSecret);
        }
        self.check_coordinator_key(coordinator_key)
    }

    /// Worker of a tracked transaction the session may use.
    fn worker(&self, transaction_id: TransactionId, session_token: Option<&str>) -> Result<Option<Arc<TransactionWorker>>> {
        let transactions = self.transactions.lock();
        let Some(tracked) = transactions.get(&transaction_id) else {
            return Ok(None);
        };
        if let Some(session_token) = session_token {
            let owns = tracked.owner.as_deref() == Some(session_token);
            if !owns && !self.sessions.is_instance_admin_or_system(session_token) {
                return Err(MaatError::AccessDenied(transaction_id));
            }
        }
        Ok(Some(Arc::clone(&tracked.worker)))
    }

    /// Error for a call on an id without a worker.
    fn untracked(&self, transaction_id: TransactionId) -> Result<MaatError> {
        Ok(match self.log.last_status(&transaction_id)? {
            Some(entry) if entry.status.is_terminal() => MaatError::AlreadyFinished {
                id: transaction_id,
                status: entry.status,
            },
            Some(entry) => self.not_recovered(transaction_id, entry.status),
            None => MaatError::TransactionNotFound(transaction_id),
        })
    }

    /// The log has an unfinished entry that `recover_transactions_from_log` has not loaded yet.
    fn not_recovered(&self, transaction_id: TransactionId, status: TransactionStatus) -> MaatError {
        MaatError::IllegalState(format!(
            "transaction '{}' is logged as {} but participant '{}' has not recovered it yet",
            transaction_id, status, self.participant_id
        ))
    }

    fn forget_if_finished(&self, transaction_id: TransactionId) {
        let finished = {
            let mut transactions = self.transactions.lock();
            if transactions
                .get(&transaction_id)
                .is_some_and(|tracked| tracked.worker.is_finished())
            {
                transactions.remove(&transaction_id)
            } else {
                None
            }
        };
        if let Some(tracked) = finished {
            // The thread is already on its way out, reap it.
            tracked.worker.shutdown();
            debug!(
                "Participant '{}' forgot finished transaction '{}'",
                self.participant_id, transaction_id
            );
        }
    }

    fn register(&self, transaction_id: TransactionId, session_token: &str) -> Result<Arc<TransactionWorker>> {
        // Ids are never reused. The log is read before the map lock is taken.
        if self.log.last_status(&transaction_id)?.is_some() {
            return Err(MaatError::TransactionExists(transaction_id));
        }

        let mut transactions = self.transactions.lock();
        transactions.retain(|_, tracked| !tracked.worker.is_finished());
        if transactions.contains_key(&transaction_id) {
            return Err(MaatError::TransactionExists(transaction_id));
        }
        if let Some((existing, _)) = transactions
            .iter()
            .find(|(_, tracked)| tracked.owner.as_deref() == Some(session_token))
        {
            return Err(MaatError::SessionBusy(*existing));
        }
        if transactions.len() >= self.config.transaction_count_limit {
            return Err(MaatError::CapacityExceeded {
                limit: self.config.transaction_count_limit,
            });
        }

        let worker = Arc::new(TransactionWorker::spawn(
            transaction_id,
            Arc::clone(&self.provider),
            Arc::clone(&self.operations),
            Arc::clone(&self.log),
        )?);
        transactions.insert(
            transaction_id,
            Tracked {
                worker: Arc::clone(&worker),
                owner: Some(session_token.to_string()),
            },
        );
        Ok(worker)
    }

    fn rollback_untracked(&self, transaction_id: TransactionId) -> Result<()> {
        match self.log.last_status(&transaction_id)? {
            None => {
                debug!(
                    "Participant '{}' ignores rollback of unknown transaction '{}'",
                    self.participant_id, transaction_id
                );
                Ok(())
            }
            Some(entry) if entry.status.is_terminal() => Err(MaatError::AlreadyFinished {
                id: transaction_id,
                status: entry.status,
            }),
            Some(entry) => Err(self.not_recovered(transaction_id, entry.status)),
        }
    }

    fn log_failure<T>(&self, transaction_id: TransactionId, method: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(
                "Participant '{}' failed {} of transaction '{}': {}",
                self.participant_id, method, transaction_id, e
            );
        }
        result
    }
}

impl<P: ResourceProvider> Participant for TransactionParticipant<P> {
    fn participant_id(&self) -> &str {
        &self.participant_id
    }

    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            if let Some(coordinator_key) = coordinator_key {
                self.check_coordinator_key(coordinator_key)?;
            }

            let worker = self.register(transaction_id, session_token)?;
            let begun = worker.begin(coordinator_key.is_some(), coordinator_key);
            if begun.is_err() {
                if worker.state() == WorkerState::New {
                    self.transactions.lock().remove(&transaction_id);
                    worker.shutdown();
                } else {
                    // A begin whose rollback failed stays tracked for the retry.
                    self.forget_if_finished(transaction_id);
                }
            }
            begun
        })();
        self.log_failure(transaction_id, "beginTransaction", result)
    }

    fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation_name: &str,
        operation_arguments: Vec<Value>,
    ) -> Result<Value> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            let worker = self
                .worker(transaction_id, Some(session_token))?
                .ok_or_else(|| MaatError::TransactionNotFound(transaction_id))?;
            let result = worker.execute_operation(operation_name, operation_arguments);
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "executeOperation", result)
    }

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            self.check_coordinator_key(coordinator_key)?;
            let Some(worker) = self.worker(transaction_id, Some(session_token))? else {
                return Err(self.untracked(transaction_id)?);
            };
            let result = worker.prepare(Some(coordinator_key));
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "prepareTransaction", result)
    }

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            let Some(worker) = self.worker(transaction_id, Some(session_token))? else {
                return Err(self.untracked(transaction_id)?);
            };
            let result = worker.commit(None, Admission::Fail).map(|_| ());
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "commitTransaction", result)
    }

    fn commit_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_interactive_session_key(interactive_session_key)?;
            self.check_coordinator_key_present(coordinator_key)?;
            let Some(worker) = self.worker(transaction_id, None)? else {
                return Err(self.untracked(transaction_id)?);
            };
            let result = worker
                .commit(Some(coordinator_key), Admission::Wait(RECOVERY_LOCK_TIMEOUT))
                .map(|_| ());
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "commitRecoveredTransaction", result)
    }

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            let Some(worker) = self.worker(transaction_id, Some(session_token))? else {
                return self.rollback_untracked(transaction_id);
            };
            let result = worker.rollback(None, Admission::Fail).map(|_| ());
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "rollbackTransaction", result)
    }

    fn rollback_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_interactive_session_key(interactive_session_key)?;
            self.check_coordinator_key_present(coordinator_key)?;
            let Some(worker) = self.worker(transaction_id, None)? else {
                return self.rollback_untracked(transaction_id);
            };
            let result = worker
                .rollback(Some(coordinator_key), Admission::Wait(RECOVERY_LOCK_TIMEOUT))
                .map(|_| ());
            self.forget_if_finished(transaction_id);
            result
        })();
        self.log_failure(transaction_id, "rollbackRecoveredTransaction", result)
    }

    fn get_transactions(&self, coordinator_key: &str) -> Result<Vec<TransactionId>> {
        self.check_coordinator_key_present(coordinator_key)?;
        let mut ids: Vec<TransactionId> = self
            .transactions
            .lock()
            .iter()
            .filter(|(_, tracked)| !tracked.worker.is_finished())
            .map(|(transaction_id, _)| *transaction_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn recover_transactions(
        &self,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<Vec<TransactionId>> {
        self.check_interactive_session_key(interactive_session_key)?;
        self.check_coordinator_key_present(coordinator_key)?;
        let mut ids: Vec<TransactionId> = self
            .transactions
            .lock()
            .iter()
            .filter(|(_, tracked)| tracked.worker.state() == WorkerState::Prepared)
            .map(|(transaction_id, _)| *transaction_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl<P: ResourceProvider> Recoverable for TransactionParticipant<P> {
    fn name(&self) -> &str {
        &self.participant_id
    }

    fn recover_transactions_from_log(&self) -> Result<usize> {
        let statuses = self.log.last_statuses()?;
        let mut transactions = self.transactions.lock();
        let mut recovered = 0;

        for (transaction_id, mut entry) in statuses {
            if entry.status.is_terminal() || transactions.contains_key(&transaction_id) {
                continue;
            }
            entry.last_accessed_ms = 0;
            let worker = TransactionWorker::recover(
                &entry,
                Arc::clone(&self.provider),
                Arc::clone(&self.operations),
                Arc::clone(&self.log),
            )?;
            transactions.insert(
                transaction_id,
                Tracked {
                    worker: Arc::new(worker),
                    owner: None,
                },
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!(
                "Participant '{}' recovered {} unfinished transactions from its log",
                self.participant_id, recovered
            );
        }
        Ok(recovered)
    }

    fn finish_failed_or_abandoned_transactions(&self) -> Result<usize> {
        use TransactionStatus::*;

        let workers: Vec<Arc<TransactionWorker>> = self
            .transactions
            .lock()
            .values()
            .map(|tracked| Arc::clone(&tracked.worker))
            .collect();
        let timeout = self.config.transaction_timeout();
        let secret = Some(self.config.coordinator_key.as_str());
        let mut finished = 0;

        for worker in workers {
            if worker.is_finished() {
                self.forget_if_finished(worker.transaction_id());
                continue;
            }
            let two_phase = worker.is_two_phase();
            let outcome = match worker.status() {
                BeginStarted | PrepareStarted | RollbackStarted => {
                    Some(("rollback", worker.rollback(secret, Admission::Skip)))
                }
                // A one-phase commit can only be retried while the handle is alive.
                CommitStarted | CommitInconsistent if !two_phase && worker.is_recovered() => {
                    Some(("rollback", worker.rollback(secret, Admission::Skip)))
                }
                New | BeginFinished if worker.idle_for() > timeout => {
                    Some(("rollback", worker.rollback(secret, Admission::Skip)))
                }
                CommitStarted | CommitInconsistent => {
                    Some(("commit", worker.commit(secret, Admission::Skip)))
                }
                // Prepared transactions wait for the coordinator's decision.
                _ => None,
            };

            match outcome {
                Some((_, Ok(true))) => finished += 1,
                Some((action, Err(e))) => warn!(
                    "Participant '{}' could not {} abandoned transaction '{}': {}",
                    self.participant_id,
                    action,
                    worker.transaction_id(),
                    e
                ),
                _ => {}
            }
            self.forget_if_finished(worker.transaction_id());
        }

        if finished > 0 {
            info!(
                "Participant '{}' finished {} failed or abandoned transactions",
                self.participant_id, finished
            );
        }
        Ok(finished)
    }
}

impl<P: ResourceProvider> Drop for TransactionParticipant<P> {
    fn drop(&mut self) {
        self.close();
    }
}
