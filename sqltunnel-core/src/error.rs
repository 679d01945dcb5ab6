use thiserror::Error;

use crate::protocol::{ErrorKind, ErrorResponse};
use crate::router::PoolStats;
use crate::session::ResourceKind;

const SQLSTATE_CONNECTION_FAILURE: &str = "08001";
const SQLSTATE_CONNECTION_EXCEPTION: &str = "08000";
const SQLSTATE_CONNECTION_DOES_NOT_EXIST: &str = "08003";
const SQLSTATE_DATA_EXCEPTION: &str = "22000";
const SQLSTATE_SYNTAX_OR_ACCESS: &str = "42000";
const SQLSTATE_INVALID_TRANSACTION_STATE: &str = "25000";
const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";
const SQLSTATE_PROGRAM_LIMIT_EXCEEDED: &str = "54000";
const SQLSTATE_GENERAL: &str = "HY000";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] duckdb::arrow::error::ArrowError),
    #[error("timed out after {waited_ms}ms waiting for a pooled connection ({stats})")]
    ConnectionTimeout { waited_ms: u64, stats: PoolStats },
    #[error("failed to build connection pool: {0}")]
    PoolBuild(String),
    #[error("failed to open a pooled connection: {0}")]
    ConnectionFailed(String),
    #[error("result exceeds the {limit_bytes}-byte materialisation limit")]
    ResultTooLarge { limit_bytes: usize },
    #[error("circuit open for statement {fingerprint}; retry after cool-down")]
    CircuitOpen { fingerprint: String },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("{kind} not found: {id}")]
    ResourceNotFound { kind: ResourceKind, id: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("lob stream error: {0}")]
    LobStream(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("no active transaction")]
    TransactionNotActive,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn resource_not_found(kind: ResourceKind, id: impl ToString) -> Self {
        Self::ResourceNotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::DuckDb(_) if self.is_data_exception() => ErrorKind::DataException,
            ServerError::DuckDb(_) | ServerError::Arrow(_) | ServerError::ResultTooLarge { .. } => {
                ErrorKind::SqlException
            }
            ServerError::ConnectionTimeout { .. }
            | ServerError::PoolBuild(_)
            | ServerError::ConnectionFailed(_)
            | ServerError::CircuitOpen { .. }
            | ServerError::MaxSessionsReached => ErrorKind::Connection,
            ServerError::SessionNotFound(_) | ServerError::SessionClosed(_) => {
                ErrorKind::SessionNotFound
            }
            ServerError::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            ServerError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            ServerError::LobStream(_) => ErrorKind::LobStream,
            ServerError::TransactionNotActive | ServerError::InvalidRequest(_) => {
                ErrorKind::InvalidRequest
            }
            ServerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn sql_state(&self) -> &'static str {
        match self {
            ServerError::DuckDb(_) if self.is_data_exception() => SQLSTATE_DATA_EXCEPTION,
            ServerError::DuckDb(_) if self.engine_message_has(SYNTAX_CLASSES) => {
                SQLSTATE_SYNTAX_OR_ACCESS
            }
            ServerError::DuckDb(_) | ServerError::Arrow(_) => SQLSTATE_GENERAL,
            ServerError::ResultTooLarge { .. } => SQLSTATE_PROGRAM_LIMIT_EXCEEDED,
            ServerError::ConnectionTimeout { .. }
            | ServerError::PoolBuild(_)
            | ServerError::ConnectionFailed(_) => SQLSTATE_CONNECTION_FAILURE,
            ServerError::CircuitOpen { .. } | ServerError::MaxSessionsReached => {
                SQLSTATE_CONNECTION_EXCEPTION
            }
            ServerError::SessionNotFound(_) | ServerError::SessionClosed(_) => {
                SQLSTATE_CONNECTION_DOES_NOT_EXIST
            }
            ServerError::UnsupportedOperation(_) => SQLSTATE_FEATURE_NOT_SUPPORTED,
            ServerError::TransactionNotActive => SQLSTATE_INVALID_TRANSACTION_STATE,
            ServerError::ResourceNotFound { .. }
            | ServerError::LobStream(_)
            | ServerError::InvalidRequest(_)
            | ServerError::Internal(_) => SQLSTATE_GENERAL,
        }
    }

    /// Engine errors raised by the statement itself rather than by the plumbing around it.
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            ServerError::DuckDb(_) | ServerError::Arrow(_) | ServerError::ResultTooLarge { .. }
        )
    }

    /// Invalid literal, cast or range errors the client can fix by changing its input.
    pub fn is_data_exception(&self) -> bool {
        self.engine_message_has(DATA_CLASSES)
    }

    /// The engine reported a transaction that must be rolled back before reuse.
    /// Other transaction-context errors, such as committing with no open
    /// transaction, leave nothing to roll back.
    pub fn is_transaction_abort(&self) -> bool {
        self.engine_message_has(&["Current transaction is aborted"])
    }

    /// The underlying connection can no longer be used.
    pub fn is_connection_fatal(&self) -> bool {
        self.engine_message_has(&[
            "FATAL Error",
            "database has been invalidated",
            "Connection Error",
        ])
    }

    fn engine_message_has(&self, needles: &[&str]) -> bool {
        match self {
            ServerError::DuckDb(err) => {
                let msg = err.to_string();
                needles.iter().any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind() as i32,
            message: self.to_string(),
            sql_state: self.sql_state().to_string(),
            vendor_code: 0,
        }
    }
}

const DATA_CLASSES: &[&str] = &[
    "Conversion Error",
    "Invalid Input Error",
    "Out of Range Error",
];

const SYNTAX_CLASSES: &[&str] = &["Parser Error", "Binder Error", "Catalog Error"];

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            ServerError::Internal("blocking task panicked".to_string())
        } else {
            ServerError::Internal(format!("blocking task cancelled: {err}"))
        }
    }
}
