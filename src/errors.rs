pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by store operations.
///
/// Precondition failures abort the surrounding transaction without touching
/// any table or index row. Callers are expected to match on the variant, not
/// the message; the unknown-op variants carry the offending op name for
/// logging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("node does not exist")]
    MissingNode,

    #[error("service does not exist")]
    MissingService,

    #[error("Missing check '{0}'")]
    MissingCheck(String),

    #[error("check '{0}' is in critical state")]
    CriticalCheck(String),

    #[error("session ID is required")]
    MissingSessionId,

    #[error("session is required on this entry")]
    MissingSession,

    #[error("no session '{0}'")]
    InvalidSession(String),

    #[error("invalid session behavior '{0}'")]
    InvalidSessionBehavior(String),

    #[error("ACL ID is required")]
    MissingAclId,

    #[error("invalid KVS operation '{0}'")]
    UnknownKvsOp(String),

    #[error("invalid session operation '{0}'")]
    UnknownSessionOp(String),

    #[error("invalid ACL operation '{0}'")]
    UnknownAclOp(String),

    #[error("invalid tombstone operation '{0}'")]
    UnknownTombstoneOp(String),
}
