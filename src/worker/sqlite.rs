//! Blocking `SQLite` driver for workers, backed by rusqlite.

use std::collections::{BTreeMap, VecDeque};

use rusqlite::types::Value as SqliteValue;
use serde_json::{Map, Number, Value};

use super::driver::{ConnectArgs, ParamKey, SyncConnection, SyncDriver, SyncStatement};
use crate::error::NativeError;

/// `SQLITE_ERROR`, used for failures that carry no code of their own.
const GENERIC_ERROR: i64 = 1;

fn native(err: &rusqlite::Error) -> NativeError {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => NativeError::new(
            i64::from(failure.extended_code),
            message.clone().unwrap_or_else(|| failure.to_string()),
        ),
        other => NativeError::new(GENERIC_ERROR, other.to_string()),
    }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(flag) => SqliteValue::Integer(i64::from(*flag)),
        Value::Number(n) => match n.as_i64() {
            Some(int) => SqliteValue::Integer(int),
            None => SqliteValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqliteValue::Text(text.clone()),
        other => SqliteValue::Text(other.to_string()),
    }
}

fn to_json(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(int) => Value::from(int),
        SqliteValue::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        SqliteValue::Text(text) => Value::String(text),
        SqliteValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

/// Opens `sqlite:<path>` DSNs; `sqlite::memory:` is an in-memory database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteSyncDriver;

impl SyncDriver for SqliteSyncDriver {
    type Connection = SqliteSyncConnection;
    type Statement = SqliteSyncStatement;

    fn connect(&self, args: &ConnectArgs) -> Result<SqliteSyncConnection, NativeError> {
        let Some(path) = args.dsn.strip_prefix("sqlite:") else {
            return Err(NativeError::new(
                GENERIC_ERROR,
                format!("could not find driver for dsn '{}'", args.dsn),
            ));
        };
        let inner = if path.is_empty() || path == ":memory:" {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(path)
        }
        .map_err(|err| native(&err))?;
        Ok(SqliteSyncConnection { inner })
    }
}

pub struct SqliteSyncConnection {
    inner: rusqlite::Connection,
}

impl SqliteSyncConnection {
    fn batch(&self, sql: &str) -> Result<(), NativeError> {
        self.inner.execute_batch(sql).map_err(|err| native(&err))
    }
}

impl SyncConnection for SqliteSyncConnection {
    type Statement = SqliteSyncStatement;

    fn driver_name(&self) -> String {
        "sqlite".to_string()
    }

    fn prepare(&mut self, sql: &str) -> Result<SqliteSyncStatement, NativeError> {
        let statement = self.inner.prepare(sql).map_err(|err| native(&err))?;
        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        drop(statement);
        Ok(SqliteSyncStatement {
            sql: sql.to_string(),
            columns,
            bound: BTreeMap::new(),
            rows: VecDeque::new(),
            row_count: 0,
        })
    }

    fn query(&mut self, sql: &str) -> Result<SqliteSyncStatement, NativeError> {
        let mut statement = self.prepare(sql)?;
        statement.execute(self, None)?;
        Ok(statement)
    }

    /// Row-returning statements are stepped to completion and report 0.
    fn exec(&mut self, sql: &str) -> Result<u64, NativeError> {
        let mut statement = self.inner.prepare(sql).map_err(|err| native(&err))?;
        if statement.column_count() == 0 {
            let changed = statement.raw_execute().map_err(|err| native(&err))?;
            return Ok(changed as u64);
        }
        let mut rows = statement.raw_query();
        while rows.next().map_err(|err| native(&err))?.is_some() {}
        Ok(0)
    }

    fn begin_transaction(&mut self) -> Result<(), NativeError> {
        self.batch("BEGIN")
    }

    fn commit(&mut self) -> Result<(), NativeError> {
        self.batch("COMMIT")
    }

    fn roll_back(&mut self) -> Result<(), NativeError> {
        self.batch("ROLLBACK")
    }

    fn in_transaction(&self) -> bool {
        !self.inner.is_autocommit()
    }

    fn last_insert_id(&mut self, _sequence: Option<&str>) -> Result<Value, NativeError> {
        Ok(Value::String(self.inner.last_insert_rowid().to_string()))
    }
}

/// A statement is kept as its SQL plus bound values. Each execution
/// re-prepares it and buffers the full result.
#[derive(Debug)]
pub struct SqliteSyncStatement {
    sql: String,
    columns: Vec<String>,
    bound: BTreeMap<ParamKey, Value>,
    rows: VecDeque<Vec<Value>>,
    row_count: u64,
}

impl SqliteSyncStatement {
    fn row_object(&self, row: Vec<Value>) -> Value {
        let object: Map<String, Value> = self.columns.iter().cloned().zip(row).collect();
        Value::Object(object)
    }
}

impl SyncStatement for SqliteSyncStatement {
    type Connection = SqliteSyncConnection;

    fn bind_value(&mut self, key: ParamKey, value: Value) -> Result<(), NativeError> {
        self.bound.insert(key, value);
        Ok(())
    }

    fn execute(
        &mut self,
        connection: &mut SqliteSyncConnection,
        params: Option<Vec<Value>>,
    ) -> Result<(), NativeError> {
        let mut statement = connection
            .inner
            .prepare(&self.sql)
            .map_err(|err| native(&err))?;
        let bindings: Vec<(ParamKey, Value)> = match params {
            Some(values) => values
                .into_iter()
                .enumerate()
                .map(|(idx, value)| (ParamKey::Position(idx + 1), value))
                .collect(),
            None => self
                .bound
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        for (key, value) in bindings {
            let index = match &key {
                ParamKey::Position(position) => *position,
                ParamKey::Name(name) => statement
                    .parameter_index(&format!(":{name}"))
                    .map_err(|err| native(&err))?
                    .ok_or_else(|| {
                        NativeError::new(GENERIC_ERROR, format!("unknown parameter {key}"))
                    })?,
            };
            statement
                .raw_bind_parameter(index, to_sqlite(&value))
                .map_err(|err| native(&err))?;
        }

        self.rows.clear();
        let column_count = statement.column_count();
        if column_count == 0 {
            let changed = statement.raw_execute().map_err(|err| native(&err))?;
            self.row_count = changed as u64;
            return Ok(());
        }
        let mut rows = statement.raw_query();
        while let Some(row) = rows.next().map_err(|err| native(&err))? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let value: SqliteValue = row.get(idx).map_err(|err| native(&err))?;
                values.push(to_json(value));
            }
            self.rows.push_back(values);
        }
        self.row_count = self.rows.len() as u64;
        Ok(())
    }

    fn fetch(&mut self) -> Option<Value> {
        let row = self.rows.pop_front()?;
        Some(self.row_object(row))
    }

    fn fetch_all(&mut self) -> Vec<Value> {
        let rows: Vec<Vec<Value>> = self.rows.drain(..).collect();
        rows.into_iter().map(|row| self.row_object(row)).collect()
    }

    fn fetch_column(&mut self, column: usize) -> Option<Value> {
        let mut row = self.rows.pop_front()?;
        if column < row.len() {
            Some(row.swap_remove(column))
        } else {
            None
        }
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn close_cursor(&mut self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory() -> SqliteSyncConnection {
        let args = ConnectArgs {
            dsn: "sqlite::memory:".into(),
            ..ConnectArgs::default()
        };
        SqliteSyncDriver.connect(&args).unwrap()
    }

    #[test]
    fn rejects_foreign_dsn() {
        let args = ConnectArgs {
            dsn: "mysql:host=localhost".into(),
            ..ConnectArgs::default()
        };
        assert!(SqliteSyncDriver.connect(&args).is_err());
    }

    #[test]
    fn named_and_positional_binds() {
        let mut conn = memory();
        conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();

        let mut insert = conn.prepare("INSERT INTO t (name) VALUES (:name)").unwrap();
        insert.bind_value(ParamKey::Name("name".into()), json!("alice")).unwrap();
        insert.execute(&mut conn, None).unwrap();
        assert_eq!(insert.row_count(), 1);
        assert_eq!(conn.last_insert_id(None).unwrap(), json!("1"));

        let mut select = conn.prepare("SELECT id, name FROM t WHERE id = ?").unwrap();
        select.execute(&mut conn, Some(vec![json!(1)])).unwrap();
        assert_eq!(select.column_count(), 2);
        assert_eq!(select.fetch(), Some(json!({"id": 1, "name": "alice"})));
        assert_eq!(select.fetch(), None);
    }

    #[test]
    fn native_error_keeps_code() {
        let mut conn = memory();
        let err = conn.exec("SELEC nonsense").unwrap_err();
        assert_eq!(err.code, GENERIC_ERROR);
        assert!(!conn.in_transaction());
        assert_eq!(conn.exec("SELECT 1").unwrap(), 0);
        conn.begin_transaction().unwrap();
        assert!(conn.in_transaction());
        conn.roll_back().unwrap();
        assert!(!conn.in_transaction());
    }
}
