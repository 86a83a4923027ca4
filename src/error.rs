use thiserror::Error;
use uuid::Uuid;

/// Why a connection attempt failed. Auth rejections are terminal for the
/// task; the other reasons are retryable network conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    Unreachable,
    AuthRejected,
    Protocol,
}

impl std::fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReason::Unreachable => write!(f, "unreachable"),
            ConnectReason::AuthRejected => write!(f, "auth-rejected"),
            ConnectReason::Protocol => write!(f, "protocol-error"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Connect to {host} failed ({reason}): {detail}")]
    Connect {
        host: String,
        reason: ConnectReason,
        detail: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Authentication decisions do not change on retry; these classes are
    /// escalated as terminal task failures without consuming the retry budget.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(
            self,
            FleetError::CredentialUnavailable(_)
                | FleetError::Connect {
                    reason: ConnectReason::AuthRejected,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
