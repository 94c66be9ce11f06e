//! One thread per transaction.
//!
//! A [`TransactionWorker`] owns the resource handle of exactly one transaction.
//! Callers hand an invocation to the worker thread over a channel and block
//! until it replies. A busy slot guarded by a mutex and condition variable
//! makes sure at most one invocation per transaction is in flight. Distinct
//! transactions run on distinct threads and never wait for each other.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::errors::{MaatError, Result};
use crate::operation::{OperationBinding, OperationExecutor};
use crate::provider::ResourceProvider;
use crate::status::{TransactionId, TransactionStatus};
use crate::transaction_log::{self, TransactionLog, TransactionLogEntry, now_millis};

/// Lifecycle of a worker. Mirrors the status pairs of the transaction log:
/// `BEGIN_*` leads to `Started`, `PREPARE_*` to `Prepared` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Started,
    Prepared,
    Committed,
    RolledBack,
}

impl WorkerState {
    pub fn is_finished(self) -> bool {
        matches!(self, WorkerState::Committed | WorkerState::RolledBack)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::New => "NEW",
            WorkerState::Started => "STARTED",
            WorkerState::Prepared => "PREPARED",
            WorkerState::Committed => "COMMITTED",
            WorkerState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// What a caller does when another call of the same transaction is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Reject with [`MaatError::Busy`].
    Fail,
    /// Return without running the call.
    Skip,
    /// Wait for the running call to finish, up to the given time.
    Wait(Duration),
}

enum Call {
    Begin { two_phase: bool },
    Execute { operation: String, args: Vec<Value> },
    Prepare,
    Commit,
    Rollback,
}

impl Call {
    fn method(&self) -> &'static str {
        match self {
            Call::Begin { .. } => "beginTransaction",
            Call::Execute { .. } => "executeOperation",
            Call::Prepare => "prepareTransaction",
            Call::Commit => "commitTransaction",
            Call::Rollback => "rollbackTransaction",
        }
    }
}

struct Job {
    call: Call,
    secret: Option<String>,
    reply: Sender<Result<Value>>,
}

#[derive(Debug)]
struct Slot {
    in_flight: Option<&'static str>,
    state: WorkerState,
    status: TransactionStatus,
    two_phase: bool,
    last_accessed_ms: u64,
    /// Set once the worker thread stopped accepting calls.
    stopped: bool,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    idle: Condvar,
}

/// Handle to the worker thread of one transaction.
///
/// Dropping the last handle disconnects the channel, which ends the thread
/// without joining it.
pub struct TransactionWorker {
    transaction_id: TransactionId,
    /// Rebuilt from the log, so the resource handle is gone.
    recovered: bool,
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TransactionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("TransactionWorker")
            .field("transaction_id", &self.transaction_id)
            .field("state", &slot.state)
            .field("status", &slot.status)
            .field("in_flight", &slot.in_flight)
            .finish()
    }
}

impl TransactionWorker {
    /// Starts the worker of a new transaction. Its state is `New` until `begin` succeeds.
    pub fn spawn<P: ResourceProvider>(
        transaction_id: TransactionId,
        provider: Arc<P>,
        operations: Arc<dyn OperationExecutor<P::Transaction>>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        let core = WorkerCore {
            transaction_id,
            provider,
            operations,
            log,
            handle: None,
            state: WorkerState::New,
            status: TransactionStatus::New,
            two_phase: false,
            secret: None,
            maybe_prepared: false,
            rollback_pending: false,
        };
        Self::start(core, now_millis(), false)
    }

    /// Rebuilds the worker of a transaction found unfinished in the log after
    /// a restart.
    ///
    /// The resource handle died with the previous process, so only
    /// `commit` of a prepared transaction and `rollback` can make progress.
    /// `entry.last_accessed_ms` is taken over as is, callers pass `0` so that
    /// idle timeouts fire on the first sweep.
    pub fn recover<P: ResourceProvider>(
        entry: &TransactionLogEntry,
        provider: Arc<P>,
        operations: Arc<dyn OperationExecutor<P::Transaction>>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        use TransactionStatus::*;

        let (state, maybe_prepared) = match entry.status {
            CommitFinished | RollbackFinished => {
                return Err(MaatError::AlreadyFinished {
                    id: entry.transaction_id,
                    status: entry.status,
                });
            }
            // A one-phase transaction is never prepared. Its work died with the handle.
            _ if !entry.two_phase => (WorkerState::Started, false),
            New | BeginStarted | BeginFinished => (WorkerState::Started, false),
            PrepareStarted | RollbackStarted => (WorkerState::Started, true),
            PrepareFinished | CommitStarted | CommitInconsistent => (WorkerState::Prepared, true),
        };

        let core = WorkerCore {
            transaction_id: entry.transaction_id,
            provider,
            operations,
            log,
            handle: None,
            state,
            status: entry.status,
            two_phase: entry.two_phase,
            secret: None,
            maybe_prepared,
            rollback_pending: entry.status == RollbackStarted,
        };
        debug!(
            "Recovered transaction '{}' in state {} with status {}",
            entry.transaction_id, state, entry.status
        );
        Self::start(core, entry.last_accessed_ms, true)
    }

    fn start<P: ResourceProvider>(core: WorkerCore<P>, last_accessed_ms: u64, recovered: bool) -> Result<Self> {
        let transaction_id = core.transaction_id;
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                in_flight: None,
                state: core.state,
                status: core.status,
                two_phase: core.two_phase,
                last_accessed_ms,
                stopped: false,
            }),
            idle: Condvar::new(),
        });

        let (sender, receiver) = unbounded();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("transaction-{transaction_id}"))
            .spawn(move || run(core, receiver, thread_shared))
            .map_err(|e| {
                MaatError::Resource(format!(
                    "cannot start worker of transaction '{transaction_id}': {e}"
                ))
            })?;

        Ok(Self {
            transaction_id,
            recovered,
            shared,
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.slot.lock().state
    }

    /// Last status written to the log by this worker.
    pub fn status(&self) -> TransactionStatus {
        self.shared.slot.lock().status
    }

    /// True for workers rebuilt from the log after a restart.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn is_two_phase(&self) -> bool {
        self.shared.slot.lock().two_phase
    }

    pub fn is_finished(&self) -> bool {
        let slot = self.shared.slot.lock();
        slot.stopped || slot.state.is_finished()
    }

    /// Time since the last call was admitted.
    pub fn idle_for(&self) -> Duration {
        let last = self.shared.slot.lock().last_accessed_ms;
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Opens the resource transaction. A two-phase transaction needs the
    /// coordinator secret.
    pub fn begin(&self, two_phase: bool, secret: Option<&str>) -> Result<()> {
        self.submit(Call::Begin { two_phase }, secret, Admission::Fail)
            .map(|_| ())
    }

    pub fn execute_operation(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        let call = Call::Execute {
            operation: operation.to_string(),
            args,
        };
        self.submit(call, None, Admission::Fail)
            .map(|value| value.unwrap_or(Value::Null))
    }

    pub fn prepare(&self, secret: Option<&str>) -> Result<()> {
        self.submit(Call::Prepare, secret, Admission::Fail)
            .map(|_| ())
    }

    /// Commits the transaction. Returns `false` when skipped under [`Admission::Skip`].
    pub fn commit(&self, secret: Option<&str>, admission: Admission) -> Result<bool> {
        self.submit(Call::Commit, secret, admission)
            .map(|value| value.is_some())
    }

    /// Rolls the transaction back. Returns `false` when skipped under [`Admission::Skip`].
    pub fn rollback(&self, secret: Option<&str>, admission: Admission) -> Result<bool> {
        self.submit(Call::Rollback, secret, admission)
            .map(|value| value.is_some())
    }

    /// Stops the worker thread without touching the resource or the log.
    ///
    /// The transaction keeps its logged status, so a later recovery resolves it
    /// like after a crash. Waits for a running call to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Worker of transaction '{}' panicked", self.transaction_id);
            }
        }
    }

    fn submit(&self, call: Call, secret: Option<&str>, admission: Admission) -> Result<Option<Value>> {
        let method = call.method();
        {
            let mut slot = self.shared.slot.lock();
            let deadline = match admission {
                Admission::Wait(timeout) => Some(Instant::now() + timeout),
                _ => None,
            };
            while let Some(running) = slot.in_flight {
                match (admission, deadline) {
                    (Admission::Skip, _) => {
                        debug!(
                            "Skipping {} of transaction '{}', {} is still running",
                            method, self.transaction_id, running
                        );
                        return Ok(None);
                    }
                    (Admission::Wait(_), Some(deadline)) => {
                        if self.shared.idle.wait_until(&mut slot, deadline).timed_out()
                            && slot.in_flight.is_some()
                        {
                            return Err(self.busy(running));
                        }
                    }
                    _ => return Err(self.busy(running)),
                }
            }
            if slot.stopped {
                return Err(self.gone(&slot));
            }
            slot.in_flight = Some(method);
            slot.last_accessed_ms = now_millis();
        }

        let (reply, response) = bounded(1);
        let job = Job {
            call,
            secret: secret.map(str::to_string),
            reply,
        };
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            return Err(self.abandon());
        }

        match response.recv() {
            Ok(result) => result.map(Some),
            Err(_) => Err(self.abandon()),
        }
    }

    fn busy(&self, running: &str) -> MaatError {
        warn!(
            "Transaction '{}': previous execution for method '{}' hasn't finished yet",
            self.transaction_id, running
        );
        MaatError::Busy {
            id: self.transaction_id,
            method: running.to_string(),
        }
    }

    fn gone(&self, slot: &Slot) -> MaatError {
        if slot.status.is_terminal() {
            MaatError::AlreadyFinished {
                id: self.transaction_id,
                status: slot.status,
            }
        } else {
            MaatError::WorkerGone(self.transaction_id)
        }
    }

    /// Frees the slot of a call the worker thread never answered.
    fn abandon(&self) -> MaatError {
        let mut slot = self.shared.slot.lock();
        slot.in_flight = None;
        slot.stopped = true;
        self.shared.idle.notify_all();
        self.gone(&slot)
    }
}

fn run<P: ResourceProvider>(mut core: WorkerCore<P>, receiver: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = receiver.recv() {
        let method = job.call.method();
        let result = core.dispatch(job.call, job.secret.as_deref());
        if let Err(e) = &result {
            warn!(
                "Transaction '{}' method '{}' failed: {}",
                core.transaction_id, method, e
            );
        }

        let finished = core.state.is_finished();
        {
            let mut slot = shared.slot.lock();
            slot.state = core.state;
            slot.status = core.status;
            slot.two_phase = core.two_phase;
            slot.in_flight = None;
            slot.stopped = finished;
        }
        shared.idle.notify_all();
        let _ = job.reply.send(result);

        if finished {
            debug!(
                "Worker of transaction '{}' finished in state {}",
                core.transaction_id, core.state
            );
            return;
        }
    }

    let mut slot = shared.slot.lock();
    slot.stopped = true;
    shared.idle.notify_all();
    debug!(
        "Worker of transaction '{}' stopped in state {}",
        core.transaction_id, core.state
    );
}

/// State owned by the worker thread.
struct WorkerCore<P: ResourceProvider> {
    transaction_id: TransactionId,
    provider: Arc<P>,
    operations: Arc<dyn OperationExecutor<P::Transaction>>,
    log: Arc<dyn TransactionLog>,
    handle: Option<P::Transaction>,
    state: WorkerState,
    status: TransactionStatus,
    two_phase: bool,
    /// Coordinator secret given at begin, used when a later call brings none.
    secret: Option<String>,
    /// The resource may hold a prepared transaction under this id.
    maybe_prepared: bool,
    /// A cleanup rollback failed. Only `rollback` is accepted until it succeeds.
    rollback_pending: bool,
}

impl<P: ResourceProvider> WorkerCore<P> {
    fn dispatch(&mut self, call: Call, secret: Option<&str>) -> Result<Value> {
        match call {
            Call::Begin { two_phase } => self.begin(two_phase, secret).map(|_| Value::Null),
            Call::Execute { operation, args } => self.execute(&operation, args),
            Call::Prepare => self.prepare(secret).map(|_| Value::Null),
            Call::Commit => self.commit(secret).map(|_| Value::Null),
            Call::Rollback => self.rollback(secret).map(|_| Value::Null),
        }
    }

    fn record(&mut self, next: TransactionStatus) -> Result<()> {
        transaction_log::advance(
            self.log.as_ref(),
            self.transaction_id,
            &mut self.status,
            next,
            self.two_phase,
        )
    }

    fn illegal(&self, method: &str) -> MaatError {
        MaatError::IllegalState(format!(
            "cannot execute {} of transaction '{}' in state {}",
            method, self.transaction_id, self.state
        ))
    }

    fn check_secret(&self, secret: Option<&str>) -> Result<()> {
        if !self.two_phase {
            return Ok(());
        }
        match secret.or(self.secret.as_deref()) {
            Some(secret) if !secret.trim().is_empty() => Ok(()),
            _ => Err(MaatError::MissingCoordinatorSecret),
        }
    }

    fn begin(&mut self, two_phase: bool, secret: Option<&str>) -> Result<()> {
        if self.state != WorkerState::New {
            return Err(self.illegal("begin"));
        }
        self.two_phase = two_phase;
        if let Err(e) = self.check_secret(secret) {
            self.two_phase = false;
            return Err(e);
        }
        self.secret = secret.map(str::to_string);

        if let Err(e) = self.record(TransactionStatus::BeginStarted) {
            self.state = WorkerState::RolledBack;
            return Err(e);
        }
        let begun = self
            .provider
            .begin_transaction(self.transaction_id)
            .and_then(|handle| {
                self.handle = Some(handle);
                self.state = WorkerState::Started;
                self.record(TransactionStatus::BeginFinished)
            });
        if let Err(e) = begun {
            self.abort("begin", &e);
            return Err(e);
        }
        Ok(())
    }

    fn execute(&mut self, operation: &str, args: Vec<Value>) -> Result<Value> {
        let binding = self
            .operations
            .binding(operation)
            .ok_or_else(|| MaatError::UnknownOperation(operation.to_string()))?;
        if self.rollback_pending {
            return Err(self.illegal(operation));
        }

        let result = match binding {
            OperationBinding::Resource => {
                if self.state != WorkerState::Started {
                    return Err(self.illegal(operation));
                }
                let handle = self.handle.as_mut().ok_or_else(|| {
                    MaatError::IllegalState(format!(
                        "transaction '{}' lost its resource handle",
                        self.transaction_id
                    ))
                })?;
                self.operations.execute(operation, Some(handle), args)
            }
            OperationBinding::Detached => {
                if self.state.is_finished() {
                    return Err(self.illegal(operation));
                }
                self.operations.execute(operation, None, args)
            }
        };

        if let Err(e) = &result {
            if self.state == WorkerState::Started {
                self.abort(operation, e);
            }
        }
        result
    }

    fn prepare(&mut self, secret: Option<&str>) -> Result<()> {
        if !self.two_phase || self.state != WorkerState::Started || self.rollback_pending {
            return Err(self.illegal("prepare"));
        }
        self.check_secret(secret)?;
        let mut handle = self.handle.take().ok_or_else(|| self.illegal("prepare"))?;

        if let Err(e) = self.record(TransactionStatus::PrepareStarted) {
            self.handle = Some(handle);
            return Err(e);
        }
        self.maybe_prepared = true;
        if let Err(e) = self
            .provider
            .prepare_transaction(self.transaction_id, &mut handle)
        {
            self.handle = Some(handle);
            self.abort("prepare", &e);
            return Err(e);
        }
        drop(handle);
        self.state = WorkerState::Prepared;
        self.record(TransactionStatus::PrepareFinished)
    }

    fn commit(&mut self, secret: Option<&str>) -> Result<()> {
        if self.rollback_pending {
            return Err(self.illegal("commit"));
        }
        self.check_secret(secret)?;
        match (self.state, self.two_phase) {
            (WorkerState::Prepared, true) => {
                self.record(TransactionStatus::CommitStarted)?;
                self.provider
                    .commit_prepared_transaction(self.transaction_id)?;
            }
            (WorkerState::Started, false) => {
                if self.handle.is_none() {
                    return Err(MaatError::IllegalState(format!(
                        "transaction '{}' lost its resource handle",
                        self.transaction_id
                    )));
                }
                self.record(TransactionStatus::CommitStarted)?;
                let transaction_id = self.transaction_id;
                if let Some(handle) = self.handle.as_mut() {
                    self.provider.commit_transaction(transaction_id, handle)?;
                }
            }
            _ => return Err(self.illegal("commit")),
        }
        self.handle = None;
        self.maybe_prepared = false;
        self.state = WorkerState::Committed;
        self.record(TransactionStatus::CommitFinished)
    }

    fn rollback(&mut self, secret: Option<&str>) -> Result<()> {
        if !matches!(self.state, WorkerState::Started | WorkerState::Prepared) {
            return Err(self.illegal("rollback"));
        }
        self.check_secret(secret)?;
        if !self.two_phase && self.status == TransactionStatus::CommitStarted && self.handle.is_none() {
            warn!(
                "Rolling back one-phase transaction '{}' after an interrupted commit, \
                 the resource may already have applied it",
                self.transaction_id
            );
        }
        self.record(TransactionStatus::RollbackStarted)?;

        let transaction_id = self.transaction_id;
        if let Some(handle) = self.handle.as_mut() {
            self.provider.rollback_transaction(transaction_id, handle)?;
            self.handle = None;
        }
        if self.maybe_prepared || self.state == WorkerState::Prepared {
            self.provider.rollback_prepared_transaction(transaction_id)?;
            self.maybe_prepared = false;
        }
        self.state = WorkerState::RolledBack;
        self.rollback_pending = false;
        self.record(TransactionStatus::RollbackFinished)
    }

    /// Best-effort rollback after a failed begin, operation or prepare.
    ///
    /// Ends the worker once the rollback is done and logged. Otherwise the
    /// worker stays open with only `rollback` allowed, so the caller or the
    /// sweep can retry it. Cleanup failures are logged and never replace `cause`.
    fn abort(&mut self, method: &str, cause: &MaatError) {
        error!(
            "Rolling back transaction '{}' after {} failed: {}",
            self.transaction_id, method, cause
        );
        let transaction_id = self.transaction_id;
        if let Err(e) = self.record(TransactionStatus::RollbackStarted) {
            warn!("Cannot log rollback of transaction '{}': {}", transaction_id, e);
        }

        let mut clean = true;
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = self.provider.rollback_transaction(transaction_id, &mut handle) {
                warn!("Rollback of transaction '{}' failed: {}", transaction_id, e);
                self.handle = Some(handle);
                clean = false;
            }
        }
        if self.maybe_prepared {
            match self.provider.rollback_prepared_transaction(transaction_id) {
                Ok(()) => self.maybe_prepared = false,
                Err(e) => {
                    warn!(
                        "Rollback of prepared transaction '{}' failed: {}",
                        transaction_id, e
                    );
                    clean = false;
                }
            }
        }

        let logged = clean
            && self.status == TransactionStatus::RollbackStarted
            && match self.record(TransactionStatus::RollbackFinished) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Cannot log rollback of transaction '{}': {}", transaction_id, e);
                    false
                }
            };
        if logged {
            self.state = WorkerState::RolledBack;
            return;
        }

        warn!(
            "Transaction '{}' stays open until its rollback is retried",
            transaction_id
        );
        if self.state == WorkerState::New {
            self.state = WorkerState::Started;
        }
        self.rollback_pending = true;
    }
}
