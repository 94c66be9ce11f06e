//! The coordinator side of a distributed transaction.
//!
//! [`TransactionCoordinator`] begins a transaction on every registered
//! participant, routes operations by participant id and finishes the
//! transaction with two-phase commit. Every protocol step is written to the
//! coordinator's own log before and after it runs, so the recovery sweep can
//! finish whatever a crash interrupted.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use crate::config::TransactionConfig;
use crate::errors::{MaatError, Result};
use crate::participant::Participant;
use crate::recovery::Recoverable;
use crate::session::SessionTokenProvider;
use crate::status::{TransactionId, TransactionStatus};
use crate::transaction_log::{self, TransactionLog, now_millis};
use crate::worker::Admission;

/// Coordinator-side record of one transaction.
struct CoordinatedTransaction {
    transaction_id: TransactionId,
    /// Session that began the transaction. `None` for transactions recovered from the log.
    owner: Option<String>,
    progress: Mutex<Progress>,
    /// Method holding `progress`, reported to callers that find it locked.
    running: Mutex<&'static str>,
}

struct Progress {
    status: TransactionStatus,
    last_accessed_ms: u64,
}

impl CoordinatedTransaction {
    fn idle_for(progress: &Progress) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(progress.last_accessed_ms))
    }
}

/// Drives transactions across a fixed set of participants.
pub struct TransactionCoordinator {
    config: TransactionConfig,
    participants: Vec<Arc<dyn Participant>>,
    sessions: Arc<dyn SessionTokenProvider>,
    log: Arc<dyn TransactionLog>,
    transactions: Mutex<HashMap<TransactionId, Arc<CoordinatedTransaction>>>,
}

impl TransactionCoordinator {
    /// Creates a coordinator for `participants`, in the order phase 1 and
    /// phase 2 will visit them.
    ///
    /// # Errors
    ///
    /// [`MaatError::Disabled`] if transactions are switched off,
    /// [`MaatError::Config`] for an invalid configuration, no participants or
    /// duplicate participant ids.
    pub fn new(
        config: &TransactionConfig,
        participants: Vec<Arc<dyn Participant>>,
        sessions: Arc<dyn SessionTokenProvider>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        if participants.is_empty() {
            return Err(MaatError::Config("coordinator needs at least one participant".into()));
        }
        let mut ids = HashSet::new();
        for participant in &participants {
            if !ids.insert(participant.participant_id().to_string()) {
                return Err(MaatError::Config(format!(
                    "participant '{}' is registered twice",
                    participant.participant_id()
                )));
            }
        }

        info!(
            "Starting transaction coordinator with participants {:?}",
            participants
                .iter()
                .map(|p| p.participant_id())
                .collect::<Vec<_>>()
        );
        Ok(Self {
            config: config.clone(),
            participants,
            sessions,
            log,
            transactions: Mutex::new(HashMap::new()),
        })
    }

    pub fn participant_ids(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.participant_id()).collect()
    }

    /// Number of transactions the coordinator still tracks.
    pub fn live_transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Last status the coordinator logged for `transaction_id`.
    pub fn transaction_status(&self, transaction_id: &TransactionId) -> Result<Option<TransactionStatus>> {
        Ok(self.log.last_status(transaction_id)?.map(|entry| entry.status))
    }

    /// Removes finished transactions from the coordinator log.
    pub fn purge_finished_transactions(&self) -> Result<usize> {
        let mut purged = 0;
        for (transaction_id, entry) in self.log.last_statuses()? {
            if entry.status.is_terminal() {
                self.log.delete(&transaction_id)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Begins `transaction_id` on every participant.
    ///
    /// A participant failure is returned as is. The transaction stays at
    /// `BEGIN_STARTED`, so the caller can roll it back and the sweep rolls it
    /// back otherwise.
    pub fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;

            let transaction = self.register(transaction_id, session_token)?;
            let mut progress = self.locked(&transaction, "beginTransaction")?;

            if let Err(e) = self.advance(transaction_id, &mut progress, TransactionStatus::BeginStarted) {
                drop(progress);
                self.transactions.lock().remove(&transaction_id);
                return Err(e);
            }
            for participant in &self.participants {
                participant
                    .begin_transaction(
                        transaction_id,
                        session_token,
                        interactive_session_key,
                        Some(self.config.coordinator_key.as_str()),
                    )
                    .map_err(|e| MaatError::participant(participant.participant_id(), e))?;
            }
            self.advance(transaction_id, &mut progress, TransactionStatus::BeginFinished)
        })();
        self.log_failure(transaction_id, "beginTransaction", result)
    }

    /// Forwards an operation to the participant named `participant_id`.
    pub fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        participant_id: &str,
        operation_name: &str,
        operation_arguments: Vec<Value>,
    ) -> Result<Value> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            let transaction = self.tracked(transaction_id, session_token)?;
            let mut progress = self.locked(&transaction, "executeOperation")?;
            Self::require(transaction_id, &progress, TransactionStatus::BeginFinished, "executeOperation")?;

            let participant = self
                .participants
                .iter()
                .find(|p| p.participant_id() == participant_id)
                .ok_or_else(|| MaatError::UnknownParticipant(participant_id.to_string()))?;
            progress.last_accessed_ms = now_millis();
            participant
                .execute_operation(
                    transaction_id,
                    session_token,
                    interactive_session_key,
                    operation_name,
                    operation_arguments,
                )
                .map_err(|e| MaatError::participant(participant_id, e))
        })();
        self.log_failure(transaction_id, "executeOperation", result)
    }

    /// Commits with two-phase commit.
    ///
    /// Phase 1 prepares every participant in registration order. If any
    /// prepare fails, all participants are rolled back and the prepare error
    /// is returned. Phase 2 commits every participant. A phase 2 failure is
    /// not retried here: the transaction is logged as `COMMIT_INCONSISTENT`,
    /// [`MaatError::CommitInconsistent`] is returned and the recovery sweep
    /// commits the participants still holding the prepared transaction.
    pub fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;
            let transaction = self.tracked(transaction_id, session_token)?;
            let mut progress = self.locked(&transaction, "commitTransaction")?;
            Self::require(transaction_id, &progress, TransactionStatus::BeginFinished, "commitTransaction")?;

            self.advance(transaction_id, &mut progress, TransactionStatus::PrepareStarted)?;
            for participant in &self.participants {
                let prepared = participant.prepare_transaction(
                    transaction_id,
                    session_token,
                    interactive_session_key,
                    &self.config.coordinator_key,
                );
                if let Err(e) = prepared {
                    let cause = MaatError::participant(participant.participant_id(), e);
                    error!(
                        "Prepare of transaction '{}' failed, rolling back all participants: {}",
                        transaction_id, cause
                    );
                    self.rollback_after_failed_prepare(transaction_id, &mut progress, |p| {
                        p.rollback_transaction(transaction_id, session_token, interactive_session_key)
                    });
                    return Err(cause);
                }
            }
            self.advance(transaction_id, &mut progress, TransactionStatus::PrepareFinished)?;

            self.advance(transaction_id, &mut progress, TransactionStatus::CommitStarted)?;
            self.commit_all(transaction_id, &mut progress, |p| {
                p.commit_transaction(transaction_id, session_token, interactive_session_key)
            })?;
            drop(progress);
            self.transactions.lock().remove(&transaction_id);
            Ok(())
        })();
        self.log_failure(transaction_id, "commitTransaction", result)
    }

    /// Rolls back on every participant.
    ///
    /// All participants are attempted even when some fail. On failure the
    /// transaction stays at `ROLLBACK_STARTED` for the sweep and the first
    /// error is returned. Unknown ids are a no-op.
    pub fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        let result = (|| {
            self.check_session_token(session_token)?;
            self.check_interactive_session_key(interactive_session_key)?;

            let transaction = match self.tracked(transaction_id, session_token) {
                Ok(transaction) => transaction,
                Err(MaatError::TransactionNotFound(_)) => {
                    return self.rollback_untracked(transaction_id);
                }
                Err(e) => return Err(e),
            };
            let mut progress = self.locked(&transaction, "rollbackTransaction")?;
            if progress.status.is_commit_decided() {
                return Err(MaatError::IllegalState(format!(
                    "transaction '{}' is committing ({}), it cannot be rolled back",
                    transaction_id, progress.status
                )));
            }

            self.advance(transaction_id, &mut progress, TransactionStatus::RollbackStarted)?;
            self.rollback_all(transaction_id, &mut progress, |p| {
                p.rollback_transaction(transaction_id, session_token, interactive_session_key)
            })?;
            drop(progress);
            self.transactions.lock().remove(&transaction_id);
            Ok(())
        })();
        self.log_failure(transaction_id, "rollbackTransaction", result)
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

    fn register(&self, transaction_id: TransactionId, session_token: &str) -> Result<Arc<CoordinatedTransaction>> {
        if self.log.last_status(&transaction_id)?.is_some() {
            return Err(MaatError::TransactionExists(transaction_id));
        }
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&transaction_id) {
            return Err(MaatError::TransactionExists(transaction_id));
        }
        if let Some(existing) = transactions
            .values()
            .find(|t| t.owner.as_deref() == Some(session_token))
        {
            return Err(MaatError::SessionBusy(existing.transaction_id));
        }
        if transactions.len() >= self.config.transaction_count_limit {
            return Err(MaatError::CapacityExceeded {
                limit: self.config.transaction_count_limit,
            });
        }

        let transaction = Arc::new(CoordinatedTransaction {
            transaction_id,
            owner: Some(session_token.to_string()),
            progress: Mutex::new(Progress {
                status: TransactionStatus::New,
                last_accessed_ms: now_millis(),
            }),
            running: Mutex::new(""),
        });
        transactions.insert(transaction_id, Arc::clone(&transaction));
        Ok(transaction)
    }

    /// Tracked transaction the session may use.
    fn tracked(&self, transaction_id: TransactionId, session_token: &str) -> Result<Arc<CoordinatedTransaction>> {
        let transaction = self
            .transactions
            .lock()
            .get(&transaction_id)
            .cloned()
            .ok_or(MaatError::TransactionNotFound(transaction_id))?;
        let owns = transaction.owner.as_deref() == Some(session_token);
        if !owns && !self.sessions.is_instance_admin_or_system(session_token) {
            return Err(MaatError::AccessDenied(transaction_id));
        }
        Ok(transaction)
    }

    /// Takes the transaction lock according to `admission`. `None` means skipped.
    fn lock<'a>(
        &self,
        transaction: &'a CoordinatedTransaction,
        method: &'static str,
        admission: Admission,
    ) -> Result<Option<MutexGuard<'a, Progress>>> {
        let guard = match admission {
            Admission::Fail | Admission::Skip => transaction.progress.try_lock(),
            Admission::Wait(timeout) => transaction.progress.try_lock_for(timeout),
        };
        match guard {
            Some(guard) => {
                *transaction.running.lock() = method;
                Ok(Some(guard))
            }
            None if admission == Admission::Skip => Ok(None),
            None => {
                let running = *transaction.running.lock();
                warn!(
                    "Transaction '{}': previous execution for method '{}' hasn't finished yet",
                    transaction.transaction_id, running
                );
                Err(MaatError::Busy {
                    id: transaction.transaction_id,
                    method: running.to_string(),
                })
            }
        }
    }

    fn locked<'a>(
        &self,
        transaction: &'a CoordinatedTransaction,
        method: &'static str,
    ) -> Result<MutexGuard<'a, Progress>> {
        self.lock(transaction, method, Admission::Fail)?
            .ok_or_else(|| MaatError::Busy {
                id: transaction.transaction_id,
                method: method.to_string(),
            })
    }

    fn require(
        transaction_id: TransactionId,
        progress: &Progress,
        expected: TransactionStatus,
        method: &str,
    ) -> Result<()> {
        if progress.status != expected {
            return Err(MaatError::IllegalState(format!(
                "cannot execute {} of transaction '{}' with status {}, expected {}",
                method, transaction_id, progress.status, expected
            )));
        }
        Ok(())
    }

    fn advance(
        &self,
        transaction_id: TransactionId,
        progress: &mut Progress,
        next: TransactionStatus,
    ) -> Result<()> {
        transaction_log::advance(self.log.as_ref(), transaction_id, &mut progress.status, next, true)?;
        progress.last_accessed_ms = now_millis();
        Ok(())
    }

    fn rollback_untracked(&self, transaction_id: TransactionId) -> Result<()> {
        match self.log.last_status(&transaction_id)? {
            None => Ok(()),
            Some(entry) if entry.status.is_terminal() => Err(MaatError::AlreadyFinished {
                id: transaction_id,
                status: entry.status,
            }),
            Some(_) => Err(MaatError::TransactionNotFound(transaction_id)),
        }
    }

    /// Rolls back on every participant. Returns the first failure after all
    /// participants were attempted.
    fn rollback_all<F>(&self, transaction_id: TransactionId, progress: &mut Progress, rollback: F) -> Result<()>
    where
        F: Fn(&dyn Participant) -> Result<()>,
    {
        let mut first_error = None;
        for participant in &self.participants {
            match rollback(participant.as_ref()) {
                Ok(()) => {}
                Err(MaatError::AlreadyFinished {
                    status: TransactionStatus::RollbackFinished,
                    ..
                }) => {}
                Err(e) => {
                    let e = MaatError::participant(participant.participant_id(), e);
                    warn!("Rollback of transaction '{}' failed: {}", transaction_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => self.advance(transaction_id, progress, TransactionStatus::RollbackFinished),
        }
    }

    fn rollback_after_failed_prepare<F>(&self, transaction_id: TransactionId, progress: &mut Progress, rollback: F)
    where
        F: Fn(&dyn Participant) -> Result<()>,
    {
        let rolled_back = self
            .advance(transaction_id, progress, TransactionStatus::RollbackStarted)
            .and_then(|_| self.rollback_all(transaction_id, progress, rollback));
        match rolled_back {
            Ok(()) => {
                self.transactions.lock().remove(&transaction_id);
            }
            Err(e) => warn!(
                "Transaction '{}' is left for the recovery sweep: {}",
                transaction_id, e
            ),
        }
    }

    /// Phase 2. Attempts every participant and reports a partial commit as
    /// [`MaatError::CommitInconsistent`].
    fn commit_all<F>(&self, transaction_id: TransactionId, progress: &mut Progress, commit: F) -> Result<()>
    where
        F: Fn(&dyn Participant) -> Result<()>,
    {
        let mut committed = Vec::new();
        let mut pending = Vec::new();
        let mut first_error = None;

        for participant in &self.participants {
            match commit(participant.as_ref()) {
                Ok(())
                | Err(MaatError::AlreadyFinished {
                    status: TransactionStatus::CommitFinished,
                    ..
                }) => committed.push(participant.participant_id().to_string()),
                Err(e) => {
                    pending.push(participant.participant_id().to_string());
                    first_error.get_or_insert(MaatError::participant(participant.participant_id(), e));
                }
            }
        }

        let Some(cause) = first_error else {
            return self.advance(transaction_id, progress, TransactionStatus::CommitFinished);
        };
        error!(
            "Transaction '{}' is inconsistent: committed on {:?}, not committed on {:?}: {}",
            transaction_id, committed, pending, cause
        );
        if let Err(e) = self.advance(transaction_id, progress, TransactionStatus::CommitInconsistent) {
            error!("Cannot log inconsistent transaction '{}': {}", transaction_id, e);
        }
        Err(MaatError::CommitInconsistent {
            id: transaction_id,
            committed,
            pending,
            source: Box::new(cause),
        })
    }

    fn rollback_recovered(&self, transaction_id: TransactionId, progress: &mut Progress) -> Result<()> {
        if progress.status != TransactionStatus::RollbackStarted {
            self.advance(transaction_id, progress, TransactionStatus::RollbackStarted)?;
        }
        self.rollback_all(transaction_id, progress, |p| {
            p.rollback_recovered_transaction(
                transaction_id,
                &self.config.interactive_session_key,
                &self.config.coordinator_key,
            )
        })
    }

    /// Commits on every participant that has not committed yet.
    ///
    /// A participant that already committed answers `AlreadyFinished`. One
    /// that has not recovered its log yet fails and is retried by the next
    /// sweep. A participant with no log entry at all, whose finished entry
    /// was purged, counts as committed.
    fn commit_recovered(&self, transaction_id: TransactionId, progress: &mut Progress) -> Result<()> {
        if progress.status == TransactionStatus::PrepareFinished {
            self.advance(transaction_id, progress, TransactionStatus::CommitStarted)?;
        }
        self.commit_all(transaction_id, progress, |p| {
            match p.commit_recovered_transaction(
                transaction_id,
                &self.config.interactive_session_key,
                &self.config.coordinator_key,
            ) {
                Err(MaatError::TransactionNotFound(_)) => {
                    debug!(
                        "Participant '{}' has no record of transaction '{}'",
                        p.participant_id(),
                        transaction_id
                    );
                    Ok(())
                }
                result => result,
            }
        })
    }

    fn log_failure<T>(&self, transaction_id: TransactionId, method: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(
                "Coordinator failed {} of transaction '{}': {}",
                method, transaction_id, e
            );
        }
        result
    }
}

impl Recoverable for TransactionCoordinator {
    fn name(&self) -> &str {
        "transaction-coordinator"
    }

    fn recover_transactions_from_log(&self) -> Result<usize> {
        let statuses = self.log.last_statuses()?;
        let mut transactions = self.transactions.lock();
        let mut recovered = 0;

        for (transaction_id, entry) in statuses {
            if entry.status.is_terminal() || transactions.contains_key(&transaction_id) {
                continue;
            }
            transactions.insert(
                transaction_id,
                Arc::new(CoordinatedTransaction {
                    transaction_id,
                    owner: None,
                    progress: Mutex::new(Progress {
                        status: entry.status,
                        last_accessed_ms: 0,
                    }),
                    running: Mutex::new(""),
                }),
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!("Coordinator recovered {} unfinished transactions from its log", recovered);
        }
        Ok(recovered)
    }

    fn finish_failed_or_abandoned_transactions(&self) -> Result<usize> {
        use TransactionStatus::*;

        let transactions: Vec<Arc<CoordinatedTransaction>> =
            self.transactions.lock().values().cloned().collect();
        let timeout = self.config.transaction_timeout();
        let mut finished = 0;

        for transaction in transactions {
            let transaction_id = transaction.transaction_id;
            let Some(mut progress) =
                self.lock(&transaction, "finishFailedOrAbandonedTransactions", Admission::Skip)?
            else {
                continue;
            };

            let outcome = match progress.status {
                BeginStarted | PrepareStarted | RollbackStarted => {
                    Some(("rollback", self.rollback_recovered(transaction_id, &mut progress)))
                }
                New | BeginFinished if CoordinatedTransaction::idle_for(&progress) > timeout => {
                    Some(("rollback", self.rollback_recovered(transaction_id, &mut progress)))
                }
                PrepareFinished | CommitStarted | CommitInconsistent => {
                    Some(("commit", self.commit_recovered(transaction_id, &mut progress)))
                }
                _ => None,
            };
            let done = progress.status.is_terminal();
            drop(progress);

            match outcome {
                Some((action, Ok(()))) => {
                    info!("Coordinator finished transaction '{}' with {}", transaction_id, action);
                }
                Some((action, Err(e))) => warn!(
                    "Coordinator could not {} abandoned transaction '{}': {}",
                    action, transaction_id, e
                ),
                None => {}
            }
            if done {
                self.transactions.lock().remove(&transaction_id);
                finished += 1;
            }
        }
        Ok(finished)
    }
}
