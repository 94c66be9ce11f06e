use std::sync::Arc;
use std::time::Duration;

use maat::prelude::*;
use serde_json::json;

mod common;

use common::*;

const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Runs phase 1 the way the coordinator does and stops right after
/// `PREPARE_FINISHED` reached the coordinator log, as if the process died
/// before phase 2.
fn prepare_then_crash(cluster: &Cluster, coordinator_log: &dyn TransactionLog) -> TransactionId {
    let id = cluster.begin();
    cluster.insert(id, APPLICATION_SERVER, "space-1").unwrap();
    cluster.insert(id, AFS_SERVER, "file-1").unwrap();

    coordinator_log
        .log_status(&TransactionLogEntry::new(id, TransactionStatus::PrepareStarted, true))
        .unwrap();
    for participant in [&cluster.application_server, &cluster.afs_server] {
        participant
            .prepare_transaction(id, SESSION, INTERACTIVE_KEY, COORDINATOR_KEY)
            .unwrap();
    }
    coordinator_log
        .log_status(&TransactionLogEntry::new(id, TransactionStatus::PrepareFinished, true))
        .unwrap();
    id
}

/// Starts the sweeps the way a server does: participants first, so that the
/// coordinator sees which participants still hold the transaction.
fn start_all_recovery(cluster: &Cluster) -> Vec<RecoverySweep> {
    vec![
        start_recovery(cluster.application_server.clone(), SWEEP_INTERVAL).unwrap(),
        start_recovery(cluster.afs_server.clone(), SWEEP_INTERVAL).unwrap(),
        start_recovery(cluster.coordinator.clone(), SWEEP_INTERVAL).unwrap(),
    ]
}

#[test]
fn test_prepared_transaction_is_committed_after_restart() {
    let (logs, [coordinator_log, application_log, afs_log]) = Logs::in_memory();
    let cluster = Cluster::new(test_config(), logs.clone_handles());

    let id = prepare_then_crash(&cluster, coordinator_log.as_ref());
    assert_eq!(cluster.application_db.database().prepared_transactions(), vec![id]);
    assert_eq!(cluster.afs_db.database().prepared_transactions(), vec![id]);

    let cluster = cluster.crash_and_restart(logs);
    let sweeps = start_all_recovery(&cluster);

    // The first coordinator pass runs inside start_recovery
    assert_eq!(
        last_status(coordinator_log.as_ref(), &id),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        last_status(application_log.as_ref(), &id),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        last_status(afs_log.as_ref(), &id),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        cluster.application_db.database().get("space-1"),
        Some(json!({ "code": "space-1" }))
    );
    assert_eq!(
        cluster.afs_db.database().get("file-1"),
        Some(json!({ "code": "file-1" }))
    );
    assert!(cluster.application_db.database().prepared_transactions().is_empty());
    assert_eq!(cluster.coordinator.live_transaction_count(), 0);
    assert_eq!(cluster.application_server.live_transaction_count(), 0);

    for sweep in sweeps {
        sweep.shutdown();
    }
}

#[test]
fn test_prepared_participant_waits_for_the_coordinator() {
    let (logs, [coordinator_log, application_log, _]) = Logs::in_memory();
    let cluster = Cluster::new(test_config(), logs.clone_handles());
    let id = prepare_then_crash(&cluster, coordinator_log.as_ref());

    let cluster = cluster.crash_and_restart(logs);
    assert_eq!(cluster.application_server.recover_transactions_from_log().unwrap(), 1);
    assert_eq!(
        cluster.application_server.transaction_state(&id),
        Some(WorkerState::Prepared)
    );

    // Recovered transactions look idle forever, prepared ones are still kept
    assert_eq!(
        cluster
            .application_server
            .finish_failed_or_abandoned_transactions()
            .unwrap(),
        0
    );
    assert_eq!(
        cluster
            .application_server
            .recover_transactions(INTERACTIVE_KEY, COORDINATOR_KEY)
            .unwrap(),
        vec![id]
    );
    assert_eq!(
        last_status(application_log.as_ref(), &id),
        Some(TransactionStatus::PrepareFinished)
    );
}

#[test]
fn test_interrupted_prepare_is_rolled_back_after_restart() {
    let (logs, [coordinator_log, application_log, afs_log]) = Logs::in_memory();
    let cluster = Cluster::new(test_config(), logs.clone_handles());

    let id = cluster.begin();
    cluster.insert(id, APPLICATION_SERVER, "space-1").unwrap();
    cluster.insert(id, AFS_SERVER, "file-1").unwrap();

    // Only the application server prepared before the crash
    coordinator_log
        .log_status(&TransactionLogEntry::new(id, TransactionStatus::PrepareStarted, true))
        .unwrap();
    cluster
        .application_server
        .prepare_transaction(id, SESSION, INTERACTIVE_KEY, COORDINATOR_KEY)
        .unwrap();

    let cluster = cluster.crash_and_restart(logs);
    let sweeps = start_all_recovery(&cluster);

    assert_eq!(
        last_status(coordinator_log.as_ref(), &id),
        Some(TransactionStatus::RollbackFinished)
    );
    assert_eq!(
        last_status(application_log.as_ref(), &id),
        Some(TransactionStatus::RollbackFinished)
    );
    assert_eq!(
        last_status(afs_log.as_ref(), &id),
        Some(TransactionStatus::RollbackFinished)
    );
    assert!(cluster.application_db.database().prepared_transactions().is_empty());
    assert!(cluster.application_db.database().is_empty());
    assert!(cluster.afs_db.database().is_empty());

    drop(sweeps);
}

#[test]
fn test_partial_commit_is_finished_after_restart() {
    let (logs, [coordinator_log, _, afs_log]) = Logs::in_memory();
    let cluster = Cluster::new(test_config(), logs.clone_handles());

    let id = cluster.begin();
    cluster.insert(id, AFS_SERVER, "file-1").unwrap();
    cluster.afs_db.fail_commit(true);
    assert!(matches!(
        cluster.commit(id),
        Err(MaatError::CommitInconsistent { .. })
    ));

    // The restarted resource works again
    let cluster = cluster.crash_and_restart(logs);
    let sweeps = start_all_recovery(&cluster);

    assert_eq!(
        last_status(coordinator_log.as_ref(), &id),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        last_status(afs_log.as_ref(), &id),
        Some(TransactionStatus::CommitFinished)
    );
    assert!(cluster.afs_db.database().get("file-1").is_some());

    drop(sweeps);
}

#[test]
fn test_unprepared_one_phase_work_is_rolled_back_after_restart() {
    init_logging();
    let config = test_config();
    let log = Arc::new(MemoryTransactionLog::new());
    let database = MemoryDatabase::new();
    let start = || {
        TransactionParticipant::new(
            APPLICATION_SERVER,
            &config,
            Arc::new(database.clone()),
            Arc::new(MemoryDatabase::operations()),
            test_sessions(),
            log.clone(),
        )
        .unwrap()
    };

    let participant = start();
    let id = TransactionId::new();
    participant
        .begin_transaction(id, SESSION, INTERACTIVE_KEY, None)
        .unwrap();
    participant
        .execute_operation(id, SESSION, INTERACTIVE_KEY, "insert", vec![json!("k"), json!(1)])
        .unwrap();
    drop(participant);

    let participant = start();
    assert_eq!(participant.recover_transactions_from_log().unwrap(), 1);
    assert_eq!(participant.finish_failed_or_abandoned_transactions().unwrap(), 1);
    assert_eq!(
        participant.transaction_status(&id).unwrap(),
        Some(TransactionStatus::RollbackFinished)
    );
    assert!(database.get("k").is_none());
    assert_eq!(participant.live_transaction_count(), 0);
}

#[test]
fn test_coordinator_retries_until_participants_recover() {
    let (logs, [coordinator_log, application_log, afs_log]) = Logs::in_memory();
    let cluster = Cluster::new(test_config(), logs.clone_handles());
    let id = prepare_then_crash(&cluster, coordinator_log.as_ref());
    let cluster = cluster.crash_and_restart(logs);

    // The coordinator comes back first
    assert_eq!(cluster.coordinator.recover_transactions_from_log().unwrap(), 1);
    assert_eq!(cluster.coordinator.finish_failed_or_abandoned_transactions().unwrap(), 0);
    assert_eq!(
        last_status(application_log.as_ref(), &id),
        Some(TransactionStatus::PrepareFinished)
    );
    assert_eq!(cluster.application_db.database().prepared_transactions(), vec![id]);

    cluster.application_server.recover_transactions_from_log().unwrap();
    cluster.afs_server.recover_transactions_from_log().unwrap();
    assert_eq!(cluster.coordinator.finish_failed_or_abandoned_transactions().unwrap(), 1);

    for log in [&coordinator_log, &application_log, &afs_log] {
        assert_eq!(
            last_status(log.as_ref(), &id),
            Some(TransactionStatus::CommitFinished)
        );
    }
    assert!(cluster.application_db.database().get("space-1").is_some());
    assert!(cluster.afs_db.database().get("file-1").is_some());
}

fn one_phase_participant(
    database: Arc<FlakyDatabase>,
    log: Arc<MemoryTransactionLog>,
) -> TransactionParticipant<FlakyDatabase> {
    init_logging();
    TransactionParticipant::new(
        APPLICATION_SERVER,
        &test_config(),
        database,
        Arc::new(MemoryDatabase::operations()),
        test_sessions(),
        log,
    )
    .unwrap()
}

#[test]
fn test_interrupted_one_phase_commit_is_retried_by_the_sweep() {
    let database = Arc::new(FlakyDatabase::new(MemoryDatabase::new()));
    let participant = one_phase_participant(database.clone(), Arc::new(MemoryTransactionLog::new()));

    let id = TransactionId::new();
    participant
        .begin_transaction(id, SESSION, INTERACTIVE_KEY, None)
        .unwrap();
    participant
        .execute_operation(id, SESSION, INTERACTIVE_KEY, "insert", vec![json!("k"), json!(1)])
        .unwrap();
    database.fail_commit(true);
    assert!(participant.commit_transaction(id, SESSION, INTERACTIVE_KEY).is_err());
    assert_eq!(
        participant.transaction_status(&id).unwrap(),
        Some(TransactionStatus::CommitStarted)
    );

    // The handle is still alive, so the commit is finished rather than undone
    database.fail_commit(false);
    assert_eq!(participant.finish_failed_or_abandoned_transactions().unwrap(), 1);
    assert_eq!(
        participant.transaction_status(&id).unwrap(),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(database.database().get("k"), Some(json!(1)));
}

#[test]
fn test_recovered_one_phase_commit_is_rolled_back() {
    let log = Arc::new(MemoryTransactionLog::new());
    let id = TransactionId::new();
    log.log_status(&TransactionLogEntry::new(id, TransactionStatus::CommitStarted, false))
        .unwrap();

    let database = Arc::new(FlakyDatabase::new(MemoryDatabase::new()));
    let participant = one_phase_participant(database, log.clone());
    assert_eq!(participant.recover_transactions_from_log().unwrap(), 1);
    assert_eq!(participant.finish_failed_or_abandoned_transactions().unwrap(), 1);
    assert_eq!(
        log.history(&id),
        vec![
            TransactionStatus::CommitStarted,
            TransactionStatus::RollbackStarted,
            TransactionStatus::RollbackFinished,
        ]
    );
}

#[test]
fn test_sweep_thread_rolls_back_abandoned_transactions() {
    let config = TransactionConfig {
        transaction_timeout_secs: 1,
        ..test_config()
    };
    let (logs, [coordinator_log, _, _]) = Logs::in_memory();
    let cluster = Cluster::new(config, logs);
    let sweeps = start_all_recovery(&cluster);

    let id = cluster.begin();
    cluster.insert(id, APPLICATION_SERVER, "space-1").unwrap();

    // The client never comes back
    assert!(wait_for_condition(
        || last_status(coordinator_log.as_ref(), &id) == Some(TransactionStatus::RollbackFinished),
        5000
    ));
    assert!(wait_for_condition(
        || cluster.application_server.live_transaction_count() == 0,
        5000
    ));
    assert!(cluster.application_db.database().is_empty());

    for sweep in sweeps {
        sweep.shutdown();
    }
}

#[cfg(feature = "durable")]
fn rocks_logs(config: &TransactionConfig) -> Logs {
    Logs {
        coordinator: open_transaction_log(config, "transaction-coordinator").unwrap(),
        application_server: open_transaction_log(config, APPLICATION_SERVER).unwrap(),
        afs_server: open_transaction_log(config, AFS_SERVER).unwrap(),
    }
}

#[cfg(feature = "durable")]
#[test]
fn test_durable_logs_survive_a_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = TransactionConfig {
        transaction_log_folder_path: temp_dir.path().to_path_buf(),
        ..test_config()
    };

    let logs = rocks_logs(&config);
    let coordinator_log = Arc::clone(&logs.coordinator);
    let cluster = Cluster::new(config.clone(), logs);
    let committed = cluster.begin();
    cluster.insert(committed, APPLICATION_SERVER, "space-0").unwrap();
    cluster.commit(committed).unwrap();

    let id = prepare_then_crash(&cluster, coordinator_log.as_ref());
    drop(coordinator_log);

    // Every handle on the logs must be gone before they are reopened
    let application_database = cluster.application_db.database().clone();
    let afs_database = cluster.afs_db.database().clone();
    drop(cluster);

    let cluster = Cluster::start(
        config.clone(),
        rocks_logs(&config),
        application_database,
        afs_database,
    );
    let sweeps = start_all_recovery(&cluster);

    assert_eq!(
        cluster.coordinator.transaction_status(&id).unwrap(),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        cluster.coordinator.transaction_status(&committed).unwrap(),
        Some(TransactionStatus::CommitFinished)
    );
    assert_eq!(
        cluster.afs_server.transaction_status(&id).unwrap(),
        Some(TransactionStatus::CommitFinished)
    );
    assert!(cluster.application_db.database().get("space-1").is_some());
    assert!(cluster.afs_db.database().get("file-1").is_some());

    for sweep in sweeps {
        sweep.shutdown();
    }
}
