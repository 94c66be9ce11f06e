//! Common utilities for Maat integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use maat::prelude::*;
use maat::{MaatError, TransactionLogEntry};

pub const SESSION: &str = "session-alice";
pub const OTHER_SESSION: &str = "session-bob";
pub const ADMIN_SESSION: &str = "session-admin";
pub const INTERACTIVE_KEY: &str = "interactive-session-key";
pub const COORDINATOR_KEY: &str = "transaction-coordinator-key";
pub const APPLICATION_SERVER: &str = "application-server";
pub const AFS_SERVER: &str = "afs-server";

/// Installs a test logger once. `RUST_LOG=debug` shows the protocol steps.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> TransactionConfig {
    TransactionConfig {
        interactive_session_key: INTERACTIVE_KEY.into(),
        coordinator_key: COORDINATOR_KEY.into(),
        transaction_count_limit: 10,
        participants: vec![
            ParticipantConfig::new(APPLICATION_SERVER, "http://localhost:8888"),
            ParticipantConfig::new(AFS_SERVER, "http://localhost:8085"),
        ],
        ..TransactionConfig::default()
    }
}

pub fn test_sessions() -> Arc<StaticSessionTokens> {
    let sessions = StaticSessionTokens::new([SESSION, OTHER_SESSION]);
    sessions.add_admin(ADMIN_SESSION);
    Arc::new(sessions)
}

// --- FlakyDatabase ---

/// A [`MemoryDatabase`] whose primitives can be told to fail.
#[derive(Debug, Default)]
pub struct FlakyDatabase {
    database: MemoryDatabase,
    fail_begin: AtomicBool,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl FlakyDatabase {
    pub fn new(database: MemoryDatabase) -> Self {
        Self {
            database,
            ..Self::default()
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, primitive: &str) -> maat::Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(MaatError::Resource(format!("injected {primitive} failure")));
        }
        Ok(())
    }
}

impl ResourceProvider for FlakyDatabase {
    type Transaction = MemoryTransaction;

    fn begin_transaction(&self, transaction_id: TransactionId) -> maat::Result<MemoryTransaction> {
        Self::check(&self.fail_begin, "begin")?;
        self.database.begin_transaction(transaction_id)
    }

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> maat::Result<()> {
        Self::check(&self.fail_prepare, "prepare")?;
        self.database.prepare_transaction(transaction_id, transaction)
    }

    fn commit_prepared_transaction(&self, transaction_id: TransactionId) -> maat::Result<()> {
        Self::check(&self.fail_commit, "commit")?;
        self.database.commit_prepared_transaction(transaction_id)
    }

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> maat::Result<()> {
        Self::check(&self.fail_rollback, "rollback")?;
        self.database.rollback_transaction(transaction_id, transaction)
    }

    fn rollback_prepared_transaction(&self, transaction_id: TransactionId) -> maat::Result<()> {
        Self::check(&self.fail_rollback, "rollback")?;
        self.database.rollback_prepared_transaction(transaction_id)
    }

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        transaction: &mut MemoryTransaction,
    ) -> maat::Result<()> {
        Self::check(&self.fail_commit, "commit")?;
        self.database.commit_transaction(transaction_id, transaction)
    }
}

// --- Cluster ---

pub type TestParticipant = TransactionParticipant<FlakyDatabase>;

/// Logs that outlive a simulated process crash.
pub struct Logs {
    pub coordinator: Arc<dyn TransactionLog>,
    pub application_server: Arc<dyn TransactionLog>,
    pub afs_server: Arc<dyn TransactionLog>,
}

impl Logs {
    pub fn in_memory() -> (Self, [Arc<MemoryTransactionLog>; 3]) {
        let coordinator = Arc::new(MemoryTransactionLog::new());
        let application_server = Arc::new(MemoryTransactionLog::new());
        let afs_server = Arc::new(MemoryTransactionLog::new());
        (
            Self {
                coordinator: coordinator.clone(),
                application_server: application_server.clone(),
                afs_server: afs_server.clone(),
            },
            [coordinator, application_server, afs_server],
        )
    }

    pub fn clone_handles(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            application_server: Arc::clone(&self.application_server),
            afs_server: Arc::clone(&self.afs_server),
        }
    }
}

/// A coordinator with two participants, each over its own [`FlakyDatabase`].
pub struct Cluster {
    pub config: TransactionConfig,
    pub sessions: Arc<StaticSessionTokens>,
    pub application_server: Arc<TestParticipant>,
    pub afs_server: Arc<TestParticipant>,
    pub application_db: Arc<FlakyDatabase>,
    pub afs_db: Arc<FlakyDatabase>,
    pub coordinator: Arc<TransactionCoordinator>,
}

impl Cluster {
    pub fn new(config: TransactionConfig, logs: Logs) -> Self {
        Self::start(
            config,
            logs,
            MemoryDatabase::new(),
            MemoryDatabase::new(),
        )
    }

    /// Builds the cluster over existing databases, as after a restart.
    pub fn start(
        config: TransactionConfig,
        logs: Logs,
        application_database: MemoryDatabase,
        afs_database: MemoryDatabase,
    ) -> Self {
        init_logging();
        let sessions = test_sessions();
        let application_db = Arc::new(FlakyDatabase::new(application_database));
        let afs_db = Arc::new(FlakyDatabase::new(afs_database));

        let application_server = Arc::new(
            TransactionParticipant::new(
                APPLICATION_SERVER,
                &config,
                application_db.clone(),
                Arc::new(MemoryDatabase::operations()),
                sessions.clone(),
                logs.application_server,
            )
            .unwrap(),
        );
        let afs_server = Arc::new(
            TransactionParticipant::new(
                AFS_SERVER,
                &config,
                afs_db.clone(),
                Arc::new(MemoryDatabase::operations()),
                sessions.clone(),
                logs.afs_server,
            )
            .unwrap(),
        );
        let participants = vec![
            application_server.clone() as Arc<dyn Participant>,
            afs_server.clone() as Arc<dyn Participant>,
        ];
        let coordinator = Arc::new(
            TransactionCoordinator::new(&config, participants, sessions.clone(), logs.coordinator)
                .unwrap(),
        );

        Self {
            config,
            sessions,
            application_server,
            afs_server,
            application_db,
            afs_db,
            coordinator,
        }
    }

    /// Drops every component without any cleanup and starts fresh ones over
    /// the same logs and databases.
    pub fn crash_and_restart(self, logs: Logs) -> Self {
        let config = self.config.clone();
        let application_database = self.application_db.database().clone();
        let afs_database = self.afs_db.database().clone();
        drop(self);
        Self::start(config, logs, application_database, afs_database)
    }

    pub fn begin(&self) -> TransactionId {
        let id = TransactionId::new();
        self.coordinator
            .begin_transaction(id, SESSION, INTERACTIVE_KEY)
            .unwrap();
        id
    }

    pub fn insert(&self, id: TransactionId, participant: &str, key: &str) -> maat::Result<serde_json::Value> {
        self.coordinator.execute_operation(
            id,
            SESSION,
            INTERACTIVE_KEY,
            participant,
            "insert",
            vec![serde_json::json!(key), serde_json::json!({ "code": key })],
        )
    }

    pub fn commit(&self, id: TransactionId) -> maat::Result<()> {
        self.coordinator.commit_transaction(id, SESSION, INTERACTIVE_KEY)
    }

    pub fn rollback(&self, id: TransactionId) -> maat::Result<()> {
        self.coordinator.rollback_transaction(id, SESSION, INTERACTIVE_KEY)
    }
}

/// Whether `statuses` is a walk along the legal status graph, starting at `NEW`.
pub fn is_legal_walk(statuses: &[TransactionStatus], two_phase: bool) -> bool {
    let mut current = TransactionStatus::New;
    statuses.iter().all(|next| {
        let legal = current.can_advance_to(*next, two_phase);
        current = *next;
        legal
    })
}

pub fn last_status(log: &dyn TransactionLog, id: &TransactionId) -> Option<TransactionStatus> {
    log.last_status(id).unwrap().map(|entry: TransactionLogEntry| entry.status)
}

/// Polls `condition` until it holds or `timeout_ms` elapses.
pub fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
