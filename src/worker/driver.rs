//! Blocking client surface hosted inside a worker.

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NativeError, SqlBridgeError};

lazy_static! {
    static ref INVALID_PARAM_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_]").expect("static regex");
}

/// Connect option listing statements run once per fresh native connection.
pub const INIT_STATEMENTS_OPTION: &str = "initStatements";

/// Arguments of a `connect` task: `[dsn, username?, password?, options?]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub dsn: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// JSON-encoded driver options, kept as text so the args can key a map.
    pub options: BTreeMap<String, String>,
}

impl ConnectArgs {
    /// # Errors
    ///
    /// `InvalidTask` unless there are one to four arguments with a string DSN.
    pub fn from_args(args: &[Value]) -> Result<Self, SqlBridgeError> {
        if args.is_empty() || args.len() > 4 {
            return Err(SqlBridgeError::InvalidTask(format!(
                "Invalid number of connection params: {}",
                args.len()
            )));
        }
        let Some(dsn) = args[0].as_str() else {
            return Err(SqlBridgeError::InvalidTask("dsn must be a string".into()));
        };
        let text = |idx: usize| args.get(idx).and_then(Value::as_str).map(str::to_string);
        let options = match args.get(3) {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
            Some(Value::Null) | None => BTreeMap::new(),
            Some(_) => {
                return Err(SqlBridgeError::InvalidTask(
                    "connection options must be an object".into(),
                ));
            }
        };
        Ok(Self {
            dsn: dsn.to_string(),
            username: text(1),
            password: text(2),
            options,
        })
    }

    #[must_use]
    pub fn to_args(&self) -> Vec<Value> {
        let options: serde_json::Map<String, Value> = self
            .options
            .iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
                (key.clone(), value)
            })
            .collect();
        vec![
            Value::String(self.dsn.clone()),
            self.username.clone().map_or(Value::Null, Value::String),
            self.password.clone().map_or(Value::Null, Value::String),
            Value::Object(options),
        ]
    }

    /// Decoded option value.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<Value> {
        self.options
            .get(key)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Statements from the `initStatements` option.
    #[must_use]
    pub fn init_statements(&self) -> Vec<String> {
        match self.option(INIT_STATEMENTS_OPTION) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Bind target: 1-based position or `:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Position(usize),
    Name(String),
}

impl ParamKey {
    /// # Errors
    ///
    /// `InvalidTask` for position 0, non-integer keys, or names with
    /// characters outside `[A-Za-z0-9_]`.
    pub fn from_value(value: &Value) -> Result<Self, SqlBridgeError> {
        match value {
            Value::Number(n) => match n.as_u64().and_then(|n| usize::try_from(n).ok()) {
                Some(position) if position > 0 => Ok(ParamKey::Position(position)),
                _ => Err(SqlBridgeError::InvalidTask(format!(
                    "invalid parameter position {n}"
                ))),
            },
            Value::String(raw) => {
                let name = raw.strip_prefix(':').unwrap_or(raw);
                if name.is_empty() || INVALID_PARAM_CHARS.is_match(name) {
                    return Err(SqlBridgeError::InvalidTask(format!(
                        "Invalid parameter name '{raw}'"
                    )));
                }
                Ok(ParamKey::Name(name.to_string()))
            }
            other => Err(SqlBridgeError::InvalidTask(format!(
                "invalid parameter key {other}"
            ))),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Position(position) => write!(f, "{position}"),
            ParamKey::Name(name) => write!(f, ":{name}"),
        }
    }
}

/// A synchronous-only database client.
pub trait SyncDriver: Send + Sync + 'static {
    type Connection: SyncConnection<Statement = Self::Statement>;
    type Statement: SyncStatement<Connection = Self::Connection>;

    /// # Errors
    ///
    /// The native connect error.
    fn connect(&self, args: &ConnectArgs) -> Result<Self::Connection, NativeError>;
}

pub trait SyncConnection: Send + 'static {
    type Statement;

    /// Lowercase dialect name, e.g. `sqlite` or `mysql`.
    fn driver_name(&self) -> String;

    /// # Errors
    ///
    /// The native error.
    fn prepare(&mut self, sql: &str) -> Result<Self::Statement, NativeError>;

    /// Prepare and execute in one step.
    ///
    /// # Errors
    ///
    /// The native error.
    fn query(&mut self, sql: &str) -> Result<Self::Statement, NativeError>;

    /// Run a statement and return the affected row count.
    ///
    /// # Errors
    ///
    /// The native error.
    fn exec(&mut self, sql: &str) -> Result<u64, NativeError>;

    /// # Errors
    ///
    /// The native error.
    fn begin_transaction(&mut self) -> Result<(), NativeError>;

    /// # Errors
    ///
    /// The native error.
    fn commit(&mut self) -> Result<(), NativeError>;

    /// # Errors
    ///
    /// The native error.
    fn roll_back(&mut self) -> Result<(), NativeError>;

    fn in_transaction(&self) -> bool;

    /// # Errors
    ///
    /// The native error.
    fn last_insert_id(&mut self, sequence: Option<&str>) -> Result<Value, NativeError>;

    fn quote(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }
}

pub trait SyncStatement: Send + 'static {
    type Connection;

    /// # Errors
    ///
    /// The native error.
    fn bind_value(&mut self, key: ParamKey, value: Value) -> Result<(), NativeError>;

    /// Execute with previously bound values, or `params` when given.
    ///
    /// # Errors
    ///
    /// The native error.
    fn execute(&mut self, connection: &mut Self::Connection, params: Option<Vec<Value>>) -> Result<(), NativeError>;

    /// Next row as a column-keyed object, or `None` when exhausted.
    fn fetch(&mut self) -> Option<Value>;

    fn fetch_all(&mut self) -> Vec<Value>;

    fn fetch_column(&mut self, column: usize) -> Option<Value>;

    fn row_count(&self) -> u64;

    fn column_count(&self) -> usize;

    fn close_cursor(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_args_bounds() {
        assert!(ConnectArgs::from_args(&[]).is_err());
        assert!(ConnectArgs::from_args(&[json!("a"), json!(null), json!(null), json!({}), json!(1)]).is_err());
        let args = ConnectArgs::from_args(&[
            json!("sqlite::memory:"),
            json!("me"),
            json!(null),
            json!({"initStatements": ["PRAGMA foreign_keys = ON"]}),
        ])
        .unwrap();
        assert_eq!(args.username.as_deref(), Some("me"));
        assert_eq!(args.init_statements(), vec!["PRAGMA foreign_keys = ON".to_string()]);
        assert_eq!(ConnectArgs::from_args(&args.to_args()).unwrap(), args);
    }

    #[test]
    fn param_names_are_validated() {
        assert_eq!(
            ParamKey::from_value(&json!(":user_id")).unwrap(),
            ParamKey::Name("user_id".into())
        );
        assert_eq!(ParamKey::from_value(&json!(2)).unwrap(), ParamKey::Position(2));
        assert!(ParamKey::from_value(&json!("bad-name")).is_err());
        assert!(ParamKey::from_value(&json!(0)).is_err());
    }
}
