use thiserror::Error;

use crate::status::{TransactionId, TransactionStatus};

#[derive(Error, Debug)]
pub enum MaatError {
    /// A call arrived in a state that its guard does not accept.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Transaction '{id}' cannot move from {from} to {to}")]
    IllegalTransition {
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Transaction '{id}': previous execution for method '{method}' hasn't finished yet")]
    Busy { id: TransactionId, method: String },

    #[error("Cannot create more transactions, the limit of {limit} live transactions has been reached")]
    CapacityExceeded { limit: usize },

    #[error("Invalid or expired session token")]
    InvalidSessionToken,

    #[error("Invalid interactive session key")]
    InvalidInteractiveSessionKey,

    #[error("Invalid transaction coordinator key")]
    InvalidCoordinatorKey,

    #[error("Two phase transaction manager secret missing")]
    MissingCoordinatorSecret,

    #[error("Access denied to transaction '{0}'")]
    AccessDenied(TransactionId),

    #[error("Transaction '{0}' does not exist")]
    TransactionNotFound(TransactionId),

    #[error("Transaction '{0}' already exists")]
    TransactionExists(TransactionId),

    #[error("Cannot start a new transaction, the session already has transaction '{0}' in progress")]
    SessionBusy(TransactionId),

    #[error("Transaction '{id}' has already finished with status {status}")]
    AlreadyFinished {
        id: TransactionId,
        status: TransactionStatus,
    },

    #[error("Unknown participant '{0}'")]
    UnknownParticipant(String),

    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("Invalid arguments for operation '{operation}': {reason}")]
    InvalidArguments { operation: String, reason: String },

    /// Failure reported by the underlying resource manager.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Participant '{participant_id}' failed: {source}")]
    Participant {
        participant_id: String,
        #[source]
        source: Box<MaatError>,
    },

    /// Phase 2 failed after the commit decision. Needs the sweep or an operator.
    #[error(
        "Transaction '{id}' is inconsistent: committed on {committed:?}, not committed on {pending:?}: {source}"
    )]
    CommitInconsistent {
        id: TransactionId,
        committed: Vec<String>,
        pending: Vec<String>,
        #[source]
        source: Box<MaatError>,
    },

    #[error("Transaction log error: {0}")]
    Log(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker of transaction '{0}' is gone")]
    WorkerGone(TransactionId),

    #[error("Transactions are disabled")]
    Disabled,
}

impl MaatError {
    /// Wraps an error raised by the participant with the given id.
    pub fn participant(participant_id: impl Into<String>, source: MaatError) -> Self {
        MaatError::Participant {
            participant_id: participant_id.into(),
            source: Box::new(source),
        }
    }

    /// Strips [`MaatError::Participant`] wrappers.
    pub fn root_cause(&self) -> &MaatError {
        match self {
            MaatError::Participant { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True for the rejections that happen before any resource action is taken.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self.root_cause(),
            MaatError::InvalidSessionToken
                | MaatError::InvalidInteractiveSessionKey
                | MaatError::InvalidCoordinatorKey
                | MaatError::MissingCoordinatorSecret
                | MaatError::AccessDenied(_)
        )
    }
}

impl From<std::io::Error> for MaatError {
    fn from(e: std::io::Error) -> Self {
        MaatError::Log(e.to_string())
    }
}

#[cfg(feature = "durable")]
impl From<rocksdb::Error> for MaatError {
    fn from(e: rocksdb::Error) -> Self {
        MaatError::Log(e.to_string())
    }
}

#[cfg(feature = "durable")]
impl From<bincode::Error> for MaatError {
    fn from(e: bincode::Error) -> Self {
        MaatError::Log(format!("entry encoding failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, MaatError>;
