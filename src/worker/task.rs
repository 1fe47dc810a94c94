use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NativeError, SqlBridgeError};

/// One call sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub target_id: Option<String>,
}

impl Task {
    #[must_use]
    pub fn connect(args: Vec<Value>) -> Self {
        Self {
            operation: Operation::Connect.to_string(),
            args,
            target_id: None,
        }
    }

    #[must_use]
    pub fn connection(method: ConnectionMethod, args: Vec<Value>, id: &str) -> Self {
        Self {
            operation: Operation::Connection(method).to_string(),
            args,
            target_id: Some(id.to_string()),
        }
    }

    #[must_use]
    pub fn statement(method: StatementMethod, args: Vec<Value>, id: &str) -> Self {
        Self {
            operation: Operation::Statement(method).to_string(),
            args,
            target_id: Some(id.to_string()),
        }
    }

    /// # Errors
    ///
    /// `InvalidTask` for an empty, unnamespaced or unknown operation.
    pub fn operation(&self) -> Result<Operation, SqlBridgeError> {
        self.operation.parse()
    }

    /// # Errors
    ///
    /// `InvalidTask` when the task carries no target id.
    pub fn target(&self) -> Result<&str, SqlBridgeError> {
        self.target_id.as_deref().ok_or_else(|| {
            SqlBridgeError::InvalidTask(format!("operation {} requires a target id", self.operation))
        })
    }
}

/// Worker answer to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskReply {
    Value(Value),
    Error(RemoteError),
}

/// An error raised inside the worker, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    NotFound { message: String },
    InvalidTask { message: String },
    Native(NativeError),
    PoolShutdown { message: String },
    Other { message: String },
}

impl From<SqlBridgeError> for RemoteError {
    fn from(err: SqlBridgeError) -> Self {
        match err {
            SqlBridgeError::ResourceNotFound(message) => RemoteError::NotFound { message },
            SqlBridgeError::InvalidTask(message) => RemoteError::InvalidTask { message },
            SqlBridgeError::PoolShutdown(message) => RemoteError::PoolShutdown { message },
            SqlBridgeError::Native(native) | SqlBridgeError::Query { source: native, .. } => {
                RemoteError::Native(native)
            }
            other => RemoteError::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<RemoteError> for SqlBridgeError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { message } => SqlBridgeError::ResourceNotFound(message),
            RemoteError::InvalidTask { message } => SqlBridgeError::InvalidTask(message),
            RemoteError::Native(native) => SqlBridgeError::Native(native),
            RemoteError::PoolShutdown { message } => SqlBridgeError::PoolShutdown(message),
            RemoteError::Other { message } => SqlBridgeError::WorkerError(message),
        }
    }
}

macro_rules! wire_methods {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl FromStr for $name {
            type Err = SqlBridgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(SqlBridgeError::InvalidTask(format!(
                        "unknown {} method '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_methods! {
    /// Methods addressed to a remote connection (`pdo:<method>`).
    ConnectionMethod {
        Prepare => "prepare",
        Query => "query",
        Exec => "exec",
        BeginTransaction => "beginTransaction",
        Commit => "commit",
        RollBack => "rollBack",
        InTransaction => "inTransaction",
        LastInsertId => "lastInsertId",
        Quote => "quote",
        DriverName => "driverName",
        Destroy => "destroy",
    }
}

wire_methods! {
    /// Methods addressed to a remote statement (`statement:<method>`).
    StatementMethod {
        Execute => "execute",
        Fetch => "fetch",
        FetchAll => "fetchAll",
        FetchColumn => "fetchColumn",
        BindValue => "bindValue",
        BindParams => "bindParams",
        RowCount => "rowCount",
        ColumnCount => "columnCount",
        CloseCursor => "closeCursor",
        Destroy => "destroy",
    }
}

const CONNECTION_NAMESPACE: &str = "pdo";
const STATEMENT_NAMESPACE: &str = "statement";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Connection(ConnectionMethod),
    Statement(StatementMethod),
}

impl FromStr for Operation {
    type Err = SqlBridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SqlBridgeError::InvalidTask(
                "operation must be a non-empty string".into(),
            ));
        }
        if s == "connect" {
            return Ok(Operation::Connect);
        }
        let Some((namespace, method)) = s.split_once(':') else {
            return Err(SqlBridgeError::InvalidTask(format!(
                "invalid operation name '{s}'"
            )));
        };
        match namespace {
            CONNECTION_NAMESPACE => Ok(Operation::Connection(method.parse()?)),
            STATEMENT_NAMESPACE => Ok(Operation::Statement(method.parse()?)),
            _ => Err(SqlBridgeError::InvalidTask(format!("invalid operation - {s}"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => f.write_str("connect"),
            Operation::Connection(method) => write!(f, "{CONNECTION_NAMESPACE}:{method}"),
            Operation::Statement(method) => write!(f, "{STATEMENT_NAMESPACE}:{method}"),
        }
    }
}
