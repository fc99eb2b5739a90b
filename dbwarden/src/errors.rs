use std::time::Duration;

use thiserror::Error as ThisError;

use crate::context::CancelReason;
use crate::db::handle::Route;
use crate::db::transaction::TxState;

/// Errors raised while validating configuration. These never involve network I/O and are
/// never retried.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The driver selector names a database we can't talk to
    #[error("unsupported driver: {0:?}")]
    UnsupportedDriver(String),

    /// A target block is missing a field or carries one that can't be put in a connection string
    #[error("malformed {target} target: {reason}")]
    MalformedTarget { target: String, reason: String },

    /// The configured driver selector doesn't match the driver handed to `connect`
    #[error("configuration selects {configured} but the driver speaks {actual}")]
    DriverMismatch { configured: String, actual: String },
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Configuration rejected before any connection attempt
    #[error("invalid database configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// The primary never became live within the retry budget
    #[error("failed to connect to {target} after {attempts} attempts over {elapsed:?}")]
    ConnectFailed {
        target: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: sqlx::Error,
    },

    /// A replica could not be attached; the whole connect sequence is abandoned
    #[error("failed to register replica #{index} ({target})")]
    ReplicaRegistrationFailed {
        index: usize,
        target: String,
        #[source]
        source: sqlx::Error,
    },

    /// The pool couldn't hand out a connection for a new transaction
    #[error("failed to begin transaction")]
    BeginFailed {
        #[source]
        source: sqlx::Error,
    },

    /// A statement failed on an established connection
    #[error("operation failed on {route}")]
    OperationFailed {
        route: Route,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to commit transaction")]
    CommitFailed {
        #[source]
        source: sqlx::Error,
    },

    /// Only surfaced from an explicit `rollback`; on the automatic path it is logged instead
    #[error("failed to roll back transaction")]
    RollbackFailed {
        #[source]
        source: sqlx::Error,
    },

    /// A nested scope failed, so the enclosing transaction was rolled back instead of committed
    #[error("transaction was marked rollback-only by a nested scope and has been rolled back")]
    RollbackOnly,

    /// The transaction behind this handle has already been resolved
    #[error("transaction already {state}")]
    TransactionClosed { state: TxState },

    #[error("operation cancelled ({reason})")]
    Cancelled { reason: CancelReason },
}

impl Error {
    fn sqlx_source(&self) -> Option<&sqlx::Error> {
        match self {
            Error::ConnectFailed { source, .. }
            | Error::ReplicaRegistrationFailed { source, .. }
            | Error::BeginFailed { source }
            | Error::OperationFailed { source, .. }
            | Error::CommitFailed { source }
            | Error::RollbackFailed { source } => Some(source),
            _ => None,
        }
    }

    /// True when the underlying statement matched no rows
    pub fn is_not_found(&self) -> bool {
        matches!(self.sqlx_source(), Some(sqlx::Error::RowNotFound))
    }

    pub fn is_unique_violation(&self) -> bool {
        match self.sqlx_source() {
            Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// True if we never got a live connection, as opposed to failing on one we had
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid(_) | Error::ConnectFailed { .. } | Error::ReplicaRegistrationFailed { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Type alias for connection-layer results
pub type Result<T> = std::result::Result<T, Error>;
