use ahash::AHashSet as HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{MaatError, Result};

/// Connection settings of one remote participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParticipantConfig {
    /// Stable participant id, e.g. `application-server`.
    pub id: String,
    /// Base URL the transport adapter uses to reach the participant.
    pub url: String,
    /// RPC timeout for calls to this participant.
    #[serde(default = "default_participant_timeout_secs")]
    pub timeout_secs: u64,
}

impl ParticipantConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            timeout_secs: default_participant_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings shared by the coordinator and the participants of one deployment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TransactionConfig {
    /// When false, coordinators and participants refuse to be constructed.
    pub enabled: bool,
    /// Idle time after which an unprepared transaction is rolled back by the sweep.
    pub transaction_timeout_secs: u64,
    /// Period of the finish-failed-or-abandoned sweep.
    pub finish_transactions_interval_secs: u64,
    /// Key proving that a call originates from an authorized interactive client.
    pub interactive_session_key: String,
    /// Secret shared between the coordinator and its participants.
    pub coordinator_key: String,
    /// Folder holding one transaction log per participant name.
    pub transaction_log_folder_path: PathBuf,
    /// Maximum number of live transactions per coordinator or participant.
    pub transaction_count_limit: usize,
    pub participants: Vec<ParticipantConfig>,
}

fn default_participant_timeout_secs() -> u64 {
    30
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transaction_timeout_secs: 3600,
            finish_transactions_interval_secs: 600,
            interactive_session_key: String::new(),
            coordinator_key: String::new(),
            transaction_log_folder_path: PathBuf::from("transaction-logs"),
            transaction_count_limit: 10,
            participants: Vec::new(),
        }
    }
}

impl TransactionConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MaatError::Config(e.to_string()))
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`MaatError::Config`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MaatError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn finish_transactions_interval(&self) -> Duration {
        Duration::from_secs(self.finish_transactions_interval_secs)
    }

    pub fn participant(&self, id: &str) -> Option<&ParticipantConfig> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Checks the configuration of an enabled deployment.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Err(MaatError::Disabled);
        }
        if self.transaction_timeout_secs == 0 {
            return Err(MaatError::Config("transaction timeout must be positive".into()));
        }
        if self.finish_transactions_interval_secs == 0 {
            return Err(MaatError::Config(
                "finish transactions interval must be positive".into(),
            ));
        }
        if self.transaction_count_limit == 0 {
            return Err(MaatError::Config(
                "transaction count limit must be positive".into(),
            ));
        }
        if self.interactive_session_key.trim().is_empty() {
            return Err(MaatError::Config("interactive session key is blank".into()));
        }
        if self.coordinator_key.trim().is_empty() {
            return Err(MaatError::Config("coordinator key is blank".into()));
        }

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.id.trim().is_empty() {
                return Err(MaatError::Config("participant id is blank".into()));
            }
            if !seen.insert(participant.id.as_str()) {
                return Err(MaatError::Config(format!(
                    "participant '{}' is configured twice",
                    participant.id
                )));
            }
            if participant.timeout_secs == 0 {
                return Err(MaatError::Config(format!(
                    "participant '{}' has a zero timeout",
                    participant.id
                )));
            }
        }
        Ok(())
    }
}
