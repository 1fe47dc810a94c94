//! Caller-side stand-ins for objects living in a worker.

use serde_json::{Value, json};

use super::pool::WorkerLease;
use super::task::{ConnectionMethod, StatementMethod, Task};
use crate::bridge::PendingMarker;
use crate::error::SqlBridgeError;

fn unexpected(operation: &str, value: &Value) -> SqlBridgeError {
    SqlBridgeError::WorkerError(format!("unexpected reply to {operation}: {value}"))
}

fn expect_string(operation: &str, value: Value) -> Result<String, SqlBridgeError> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(unexpected(operation, &other)),
    }
}

fn expect_u64(operation: &str, value: &Value) -> Result<u64, SqlBridgeError> {
    value.as_u64().ok_or_else(|| unexpected(operation, value))
}

/// `false` is the worker's "nothing there".
fn optional(value: Value) -> Option<Value> {
    match value {
        Value::Bool(false) | Value::Null => None,
        other => Some(other),
    }
}

/// A connection living in a worker, addressed by its id.
///
/// One call at a time: a second call while one is outstanding fails with
/// `PendingOperation`.
#[derive(Debug)]
pub struct RemoteConnection {
    id: String,
    driver_name: String,
    worker: WorkerLease,
    pending: PendingMarker,
}

impl RemoteConnection {
    pub(crate) fn new(id: String, driver_name: String, worker: WorkerLease) -> Self {
        Self {
            id,
            driver_name,
            worker,
            pending: PendingMarker::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    #[must_use]
    pub fn worker(&self) -> &WorkerLease {
        &self.worker
    }

    async fn call(&self, method: ConnectionMethod, args: Vec<Value>) -> Result<Value, SqlBridgeError> {
        let _pending = self.pending.begin()?;
        self.worker
            .submit(Task::connection(method, args, &self.id))
            .await
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn prepare(&self, sql: &str) -> Result<RemoteStatement, SqlBridgeError> {
        let id = expect_string("prepare", self.call(ConnectionMethod::Prepare, vec![json!(sql)]).await?)?;
        Ok(RemoteStatement::new(id, self.worker.clone()))
    }

    /// Prepare and execute.
    ///
    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn query(&self, sql: &str) -> Result<RemoteStatement, SqlBridgeError> {
        let id = expect_string("query", self.call(ConnectionMethod::Query, vec![json!(sql)]).await?)?;
        Ok(RemoteStatement::new(id, self.worker.clone()))
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn exec(&self, sql: &str) -> Result<u64, SqlBridgeError> {
        let value = self.call(ConnectionMethod::Exec, vec![json!(sql)]).await?;
        expect_u64("exec", &value)
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn begin_transaction(&self) -> Result<(), SqlBridgeError> {
        self.call(ConnectionMethod::BeginTransaction, Vec::new()).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn commit(&self) -> Result<(), SqlBridgeError> {
        self.call(ConnectionMethod::Commit, Vec::new()).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn roll_back(&self) -> Result<(), SqlBridgeError> {
        self.call(ConnectionMethod::RollBack, Vec::new()).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn in_transaction(&self) -> Result<bool, SqlBridgeError> {
        let value = self.call(ConnectionMethod::InTransaction, Vec::new()).await?;
        value.as_bool().ok_or_else(|| unexpected("inTransaction", &value))
    }

    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn last_insert_id(&self, sequence: Option<&str>) -> Result<Option<Value>, SqlBridgeError> {
        let args = sequence.map(|name| vec![json!(name)]).unwrap_or_default();
        Ok(optional(self.call(ConnectionMethod::LastInsertId, args).await?))
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn quote(&self, text: &str) -> Result<String, SqlBridgeError> {
        expect_string("quote", self.call(ConnectionMethod::Quote, vec![json!(text)]).await?)
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.worker
            .defer(Task::connection(ConnectionMethod::Destroy, Vec::new(), &self.id));
    }
}

/// A statement living in a worker. Holds its compound id and a worker
/// borrow, never the connection that created it.
#[derive(Debug)]
pub struct RemoteStatement {
    id: String,
    worker: WorkerLease,
    pending: PendingMarker,
}

impl RemoteStatement {
    pub(crate) fn new(id: String, worker: WorkerLease) -> Self {
        Self {
            id,
            worker,
            pending: PendingMarker::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, method: StatementMethod, args: Vec<Value>) -> Result<Value, SqlBridgeError> {
        let _pending = self.pending.begin()?;
        self.worker
            .submit(Task::statement(method, args, &self.id))
            .await
    }

    /// Execute with bound values, or with `params` (positional) when given.
    ///
    /// # Errors
    ///
    /// `PendingOperation`, a worker error, or the native error.
    pub async fn execute(&self, params: Option<Vec<Value>>) -> Result<(), SqlBridgeError> {
        let args = params.map(|values| vec![Value::Array(values)]).unwrap_or_default();
        self.call(StatementMethod::Execute, args).await?;
        Ok(())
    }

    /// Next row as a column-keyed object.
    ///
    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn fetch(&self) -> Result<Option<Value>, SqlBridgeError> {
        Ok(optional(self.call(StatementMethod::Fetch, Vec::new()).await?))
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn fetch_all(&self) -> Result<Vec<Value>, SqlBridgeError> {
        match self.call(StatementMethod::FetchAll, Vec::new()).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(unexpected("fetchAll", &other)),
        }
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn fetch_column(&self, column: usize) -> Result<Option<Value>, SqlBridgeError> {
        Ok(optional(
            self.call(StatementMethod::FetchColumn, vec![json!(column)])
                .await?,
        ))
    }

    /// Bind one value to a 1-based position or a `:name`.
    ///
    /// # Errors
    ///
    /// `PendingOperation`, `InvalidTask` for a bad key, or the native error.
    pub async fn bind_value(&self, key: Value, value: Value) -> Result<(), SqlBridgeError> {
        self.call(StatementMethod::BindValue, vec![key, value]).await?;
        Ok(())
    }

    /// Bind an array (positional) or object (named) of values.
    ///
    /// # Errors
    ///
    /// `PendingOperation`, `InvalidTask` for a bad key, or the native error.
    pub async fn bind_params(&self, params: Value) -> Result<(), SqlBridgeError> {
        self.call(StatementMethod::BindParams, vec![params]).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn row_count(&self) -> Result<u64, SqlBridgeError> {
        let value = self.call(StatementMethod::RowCount, Vec::new()).await?;
        expect_u64("rowCount", &value)
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn column_count(&self) -> Result<u64, SqlBridgeError> {
        let value = self.call(StatementMethod::ColumnCount, Vec::new()).await?;
        expect_u64("columnCount", &value)
    }

    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn close_cursor(&self) -> Result<(), SqlBridgeError> {
        self.call(StatementMethod::CloseCursor, Vec::new()).await?;
        Ok(())
    }
}

impl Drop for RemoteStatement {
    fn drop(&mut self) {
        self.worker
            .defer(Task::statement(StatementMethod::Destroy, Vec::new(), &self.id));
    }
}
