use ahash::AHashSet as HashSet;
use parking_lot::RwLock;

/// External collaborator deciding whether a session token is still alive.
///
/// Authentication itself lives elsewhere. Transactions only consume the
/// validity check and the admin/system flag used for access checks.
pub trait SessionTokenProvider: Send + Sync {
    fn is_valid(&self, session_token: &str) -> bool;

    /// Instance admins and the system session may act on any transaction.
    fn is_instance_admin_or_system(&self, _session_token: &str) -> bool {
        false
    }
}

/// Session tokens held in memory. Suitable for tests and single-node setups.
#[derive(Debug, Default)]
pub struct StaticSessionTokens {
    valid: RwLock<HashSet<String>>,
    admins: RwLock<HashSet<String>>,
}

impl StaticSessionTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid: RwLock::new(tokens.into_iter().map(Into::into).collect()),
            admins: RwLock::new(HashSet::new()),
        }
    }

    pub fn add(&self, token: impl Into<String>) {
        self.valid.write().insert(token.into());
    }

    /// Registers a valid token that also carries admin rights.
    pub fn add_admin(&self, token: impl Into<String>) {
        let token = token.into();
        self.valid.write().insert(token.clone());
        self.admins.write().insert(token);
    }

    /// Expires a token, e.g. on logout.
    pub fn expire(&self, token: &str) {
        self.valid.write().remove(token);
        self.admins.write().remove(token);
    }
}

impl SessionTokenProvider for StaticSessionTokens {
    fn is_valid(&self, session_token: &str) -> bool {
        self.valid.read().contains(session_token)
    }

    fn is_instance_admin_or_system(&self, session_token: &str) -> bool {
        self.admins.read().contains(session_token)
    }
}
