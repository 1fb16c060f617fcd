//! Error taxonomy for a sync run.

use std::time::Duration;
use thiserror::Error;

/// Failure classes returned by the remote Gateway API.
///
/// The executor only needs these classes to decide between retrying,
/// failing a single operation, and aborting the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Rate limit, timeout, 5xx or a connection problem. Safe to retry.
    #[error("transient remote error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// The request was understood and refused. Retrying will not help.
    #[error("remote rejected request: {message}")]
    Rejected { message: String },
    /// Authentication or authorization failure. Aborts the whole run.
    #[error("fatal remote error: {message}")]
    Fatal { message: String },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Run-level errors. Anything returned here stops the run before or
/// instead of executing a plan.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{required} lists needed but the account quota is {quota}")]
    QuotaExceeded { required: usize, quota: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("inconsistent remote state: {0}")]
    InconsistentState(String),

    #[error("blocklist '{name}' could not be fetched: {reason}")]
    Source { name: String, reason: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
