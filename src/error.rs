use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Diagnostic reported by a native client library.
///
/// `code` is the vendor error number the retry policy classifies on; `sqlstate`
/// is carried through untouched when the client exposes one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct NativeError {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
    pub message: String,
}

impl NativeError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            sqlstate: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }
}

/// Which half of a transaction pair was called without its opening `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Commit,
    Rollback,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOp::Commit => f.write_str("commit"),
            TxOp::Rollback => f.write_str("rollback"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SqlBridgeError {
    #[error("{0}")]
    PoolShutdown(String),

    #[error("The previous operation must complete before another can be started")]
    PendingOperation,

    /// A native error surfaced unchanged: either never retryable by nature of the call
    /// site, or a transient error that outlived the retry bound.
    #[error(transparent)]
    Native(NativeError),

    #[error("Query failed: {context}")]
    Query {
        context: String,
        #[source]
        source: NativeError,
    },

    #[error("Reconnecting the link failed: {0}")]
    Reconnect(#[source] Box<SqlBridgeError>),

    #[error("Asymmetric transaction {0}.")]
    AsymmetricTransaction(TxOp),

    #[error("Rolled back transaction has not been completed correctly.")]
    RolledBackIncomplete,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl SqlBridgeError {
    /// The native diagnostic preserved by this error, if any.
    #[must_use]
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            SqlBridgeError::Native(native) | SqlBridgeError::Query { source: native, .. } => {
                Some(native)
            }
            SqlBridgeError::Reconnect(inner) => inner.native(),
            _ => None,
        }
    }

    /// Shortcut for the native error code, if any.
    #[must_use]
    pub fn native_code(&self) -> Option<i64> {
        self.native().map(|native| native.code)
    }

    pub(crate) fn pool_shutdown() -> Self {
        SqlBridgeError::PoolShutdown("The pool was shut down".into())
    }
}

impl From<NativeError> for SqlBridgeError {
    fn from(err: NativeError) -> Self {
        SqlBridgeError::Native(err)
    }
}

impl From<serde_json::Error> for SqlBridgeError {
    fn from(err: serde_json::Error) -> Self {
        SqlBridgeError::WorkerError(format!("malformed worker message: {err}"))
    }
}
