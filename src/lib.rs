//! Maat: two-phase commit for transactions spanning independently failing
//! services.
//!
//! A [`TransactionCoordinator`] begins a transaction on every registered
//! [`Participant`], routes named operations to them and finishes with
//! two-phase commit. Each [`TransactionParticipant`] runs every transaction on
//! its own [`TransactionWorker`] thread against one [`ResourceProvider`], and
//! both sides log every step to a [`TransactionLog`] so that
//! [`start_recovery`] can finish whatever a crash interrupted.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use maat::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> maat::Result<()> {
//! let config = TransactionConfig {
//!     interactive_session_key: "interactive-key".into(),
//!     coordinator_key: "coordinator-key".into(),
//!     ..TransactionConfig::default()
//! };
//! let sessions = Arc::new(StaticSessionTokens::new(["session-1"]));
//!
//! let database = MemoryDatabase::new();
//! let participant: Arc<TransactionParticipant<MemoryDatabase>> = Arc::new(TransactionParticipant::new(
//!     "application-server",
//!     &config,
//!     Arc::new(database.clone()),
//!     Arc::new(MemoryDatabase::operations()),
//!     sessions.clone(),
//!     open_transaction_log(&config, "application-server")?,
//! )?);
//! let coordinator = TransactionCoordinator::new(
//!     &config,
//!     vec![participant.clone() as Arc<dyn Participant>],
//!     sessions,
//!     open_transaction_log(&config, "transaction-coordinator")?,
//! )?;
//!
//! let id = TransactionId::new();
//! coordinator.begin_transaction(id, "session-1", "interactive-key")?;
//! coordinator.execute_operation(
//!     id,
//!     "session-1",
//!     "interactive-key",
//!     "application-server",
//!     "insert",
//!     vec![json!("space-1"), json!({ "code": "SPACE-1" })],
//! )?;
//! coordinator.commit_transaction(id, "session-1", "interactive-key")?;
//! assert!(database.get("space-1").is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod operation;
pub mod participant;
pub mod provider;
pub mod recovery;
pub mod resource;
pub mod session;
pub mod status;
pub mod transaction_log;
pub mod worker;

// Re-export key types for easier access
pub use config::{ParticipantConfig, TransactionConfig};
pub use coordinator::TransactionCoordinator;
pub use errors::{MaatError, Result};
pub use operation::{OperationBinding, OperationExecutor, OperationRegistry};
pub use participant::{Participant, TransactionParticipant};
pub use provider::ResourceProvider;
pub use recovery::{Recoverable, RecoverySweep, start_recovery};
pub use resource::{MemoryDatabase, MemoryTransaction};
pub use session::{SessionTokenProvider, StaticSessionTokens};
pub use status::{TransactionId, TransactionStatus};
pub use transaction_log::{
    MemoryTransactionLog, TransactionLog, TransactionLogEntry, open_transaction_log,
};
#[cfg(feature = "durable")]
pub use transaction_log::RocksDbTransactionLog;
pub use worker::{Admission, TransactionWorker, WorkerState};

pub mod prelude {
    pub use crate::errors::*;
    pub use crate::*;
}
