use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one distributed transaction.
///
/// Generated by the client or the coordinator at begin time and used both as
/// the transaction log key and as the routing key of per-transaction workers on
/// every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a fresh random (v4) transaction id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Protocol progress of one transaction as seen by one log owner
/// (a participant or the coordinator).
///
/// The forward path is
/// `NEW → BEGIN_STARTED → BEGIN_FINISHED → PREPARE_STARTED → PREPARE_FINISHED →
/// COMMIT_STARTED → COMMIT_FINISHED`. `COMMIT_INCONSISTENT` sits between
/// `COMMIT_STARTED` and `COMMIT_FINISHED` and is only written by a coordinator
/// whose second phase failed part way. The rollback branch
/// `ROLLBACK_STARTED → ROLLBACK_FINISHED` is reachable from every non-terminal
/// status except `COMMIT_INCONSISTENT`, where some participant has already
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    New,
    BeginStarted,
    BeginFinished,
    PrepareStarted,
    PrepareFinished,
    CommitStarted,
    CommitInconsistent,
    CommitFinished,
    RollbackStarted,
    RollbackFinished,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::CommitFinished | TransactionStatus::RollbackFinished
        )
    }

    pub fn is_rollback(self) -> bool {
        matches!(
            self,
            TransactionStatus::RollbackStarted | TransactionStatus::RollbackFinished
        )
    }

    /// True once the commit decision has been recorded, after which the
    /// transaction may only move forward to `COMMIT_FINISHED`.
    pub fn is_commit_decided(self) -> bool {
        matches!(
            self,
            TransactionStatus::CommitStarted
                | TransactionStatus::CommitInconsistent
                | TransactionStatus::CommitFinished
        )
    }

    /// Whether `next` may be logged after `self`.
    ///
    /// Writing the current non-terminal status again is allowed so that a failed
    /// `X_STARTED` step can be retried. Otherwise only the next status on the
    /// path is legal. The one skip is a one-phase transaction going from
    /// `BEGIN_FINISHED` straight to `COMMIT_STARTED`.
    pub fn can_advance_to(self, next: TransactionStatus, two_phase: bool) -> bool {
        use TransactionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }

        match (self, next) {
            (CommitInconsistent, RollbackStarted | RollbackFinished) => false,
            (RollbackStarted, RollbackFinished) => true,
            (RollbackStarted, _) => false,
            (_, RollbackStarted) => true,
            (BeginFinished, CommitStarted) => !two_phase,
            (New, BeginStarted)
            | (BeginStarted, BeginFinished)
            | (BeginFinished, PrepareStarted)
            | (PrepareStarted, PrepareFinished)
            | (PrepareFinished, CommitStarted)
            | (CommitStarted, CommitInconsistent | CommitFinished)
            | (CommitInconsistent, CommitFinished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::New => "NEW",
            TransactionStatus::BeginStarted => "BEGIN_STARTED",
            TransactionStatus::BeginFinished => "BEGIN_FINISHED",
            TransactionStatus::PrepareStarted => "PREPARE_STARTED",
            TransactionStatus::PrepareFinished => "PREPARE_FINISHED",
            TransactionStatus::CommitStarted => "COMMIT_STARTED",
            TransactionStatus::CommitInconsistent => "COMMIT_INCONSISTENT",
            TransactionStatus::CommitFinished => "COMMIT_FINISHED",
            TransactionStatus::RollbackStarted => "ROLLBACK_STARTED",
            TransactionStatus::RollbackFinished => "ROLLBACK_FINISHED",
        };
        f.write_str(name)
    }
}
