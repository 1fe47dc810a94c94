use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::driver::{ConnectArgs, ParamKey, SyncConnection, SyncDriver, SyncStatement};
use super::registry::{ConnectionId, Registry, StatementId};
use super::task::{ConnectionMethod, Operation, StatementMethod, Task, TaskReply};
use crate::error::SqlBridgeError;
use crate::pool::{BoundedPool, Pooled, ResourceFactory};

/// Opens native connections for the in-worker pools.
pub struct NativeFactory<D: SyncDriver> {
    driver: Arc<D>,
    args: ConnectArgs,
    init_statements: Vec<String>,
}

#[async_trait]
impl<D: SyncDriver> ResourceFactory for NativeFactory<D> {
    type Resource = D::Connection;

    async fn create(&self, _cancel: CancellationToken) -> Result<D::Connection, SqlBridgeError> {
        let mut connection = self.driver.connect(&self.args)?;
        for sql in &self.init_statements {
            connection.exec(sql)?;
        }
        debug!(dsn = %self.args.dsn, init = self.init_statements.len(), "opened native connection");
        Ok(connection)
    }
}

type HostedConnection<D> = Pooled<NativeFactory<D>>;

/// Executes tasks against a blocking driver. Lives on the worker's own thread.
///
/// Native connections are pooled per distinct connect arguments: `connect`
/// borrows one, `pdo:destroy` returns it.
pub struct WorkerHost<D: SyncDriver> {
    driver: Arc<D>,
    pool_limit: usize,
    pools: HashMap<ConnectArgs, BoundedPool<NativeFactory<D>>>,
    registry: Registry<HostedConnection<D>, D::Statement>,
    runtime: tokio::runtime::Runtime,
}

impl<D: SyncDriver> WorkerHost<D> {
    /// # Errors
    ///
    /// `ConfigError` for a zero limit, `WorkerError` if the local runtime cannot start.
    pub fn new(driver: D, pool_limit: usize) -> Result<Self, SqlBridgeError> {
        if pool_limit == 0 {
            return Err(SqlBridgeError::ConfigError(
                "worker pool_limit must be greater than zero".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| SqlBridgeError::WorkerError(format!("failed to start worker runtime: {err}")))?;
        Ok(Self {
            driver: Arc::new(driver),
            pool_limit,
            pools: HashMap::new(),
            registry: Registry::new(),
            runtime,
        })
    }

    /// Run one task, turning any failure into an error reply.
    pub fn handle(&mut self, task: &Task) -> TaskReply {
        match self.run(task) {
            Ok(value) => TaskReply::Value(value),
            Err(err) => {
                debug!(operation = %task.operation, error = %err, "task failed");
                TaskReply::Error(err.into())
            }
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry<HostedConnection<D>, D::Statement> {
        &self.registry
    }

    fn run(&mut self, task: &Task) -> Result<Value, SqlBridgeError> {
        match task.operation()? {
            Operation::Connect => self.connect(&task.args),
            Operation::Connection(method) => {
                let id: ConnectionId = task.target()?.parse()?;
                self.run_connection(id, method, &task.args)
            }
            Operation::Statement(method) => {
                let id: StatementId = task.target()?.parse()?;
                self.run_statement(id, method, &task.args)
            }
        }
    }

    fn pool_for(&mut self, args: &ConnectArgs) -> Result<BoundedPool<NativeFactory<D>>, SqlBridgeError> {
        if let Some(pool) = self.pools.get(args)
            && pool.is_running()
        {
            return Ok(pool.clone());
        }
        // Absent, or shut down by a failed connect: start over.
        let factory = NativeFactory {
            driver: Arc::clone(&self.driver),
            args: args.clone(),
            init_statements: args.init_statements(),
        };
        let pool = BoundedPool::with_label(factory, self.pool_limit, "native")?;
        self.pools.insert(args.clone(), pool.clone());
        Ok(pool)
    }

    fn connect(&mut self, raw: &[Value]) -> Result<Value, SqlBridgeError> {
        let args = ConnectArgs::from_args(raw)?;
        let pool = self.pool_for(&args)?;
        // Nothing can be released while this thread blocks on the pool.
        if !pool.status().is_idle() {
            return Err(SqlBridgeError::ConnectionError(format!(
                "worker connection limit of {} reached",
                self.pool_limit
            )));
        }
        let connection = self.runtime.block_on(pool.acquire())?;
        let driver_name = connection.driver_name();
        let id = self.registry.insert_connection(connection, driver_name.clone());
        debug!(connection = %id, driver = %driver_name, "registered connection");
        Ok(json!([id.to_string(), driver_name]))
    }

    fn run_connection(
        &mut self,
        id: ConnectionId,
        method: ConnectionMethod,
        args: &[Value],
    ) -> Result<Value, SqlBridgeError> {
        match method {
            ConnectionMethod::Destroy => {
                let removed = self.registry.remove_connection(id);
                let found = removed.is_some();
                if let Some(mut connection) = removed
                    && connection.in_transaction()
                {
                    if let Err(err) = connection.roll_back() {
                        warn!(connection = %id, error = %err, "rollback on destroy failed; discarding");
                        connection.discard();
                    }
                }
                debug!(connection = %id, removed = found, "destroyed connection");
                Ok(Value::Bool(found))
            }
            ConnectionMethod::Prepare | ConnectionMethod::Query => {
                let sql = arg_str(args, 0, method.as_str())?;
                let connection = self.registry.connection_mut(id)?;
                let statement = if method == ConnectionMethod::Prepare {
                    connection.prepare(sql)?
                } else {
                    connection.query(sql)?
                };
                let statement_id = self.registry.insert_statement(id, statement)?;
                Ok(Value::String(statement_id.to_string()))
            }
            ConnectionMethod::Exec => {
                let sql = arg_str(args, 0, method.as_str())?;
                Ok(json!(self.registry.connection_mut(id)?.exec(sql)?))
            }
            ConnectionMethod::BeginTransaction => {
                self.registry.connection_mut(id)?.begin_transaction()?;
                Ok(Value::Bool(true))
            }
            ConnectionMethod::Commit => {
                self.registry.connection_mut(id)?.commit()?;
                Ok(Value::Bool(true))
            }
            ConnectionMethod::RollBack => {
                self.registry.connection_mut(id)?.roll_back()?;
                Ok(Value::Bool(true))
            }
            ConnectionMethod::InTransaction => {
                Ok(Value::Bool(self.registry.connection_mut(id)?.in_transaction()))
            }
            ConnectionMethod::LastInsertId => {
                let sequence = args.first().and_then(Value::as_str);
                Ok(self.registry.connection_mut(id)?.last_insert_id(sequence)?)
            }
            ConnectionMethod::Quote => {
                let text = arg_str(args, 0, method.as_str())?;
                Ok(Value::String(self.registry.connection_mut(id)?.quote(text)))
            }
            ConnectionMethod::DriverName => {
                Ok(Value::String(self.registry.driver_name(id)?.to_string()))
            }
        }
    }

    fn run_statement(
        &mut self,
        id: StatementId,
        method: StatementMethod,
        args: &[Value],
    ) -> Result<Value, SqlBridgeError> {
        if method == StatementMethod::Destroy {
            return Ok(Value::Bool(self.registry.remove_statement(id).is_some()));
        }
        let (statement, connection) = self.registry.statement_mut(id)?;
        match method {
            StatementMethod::Execute => {
                let params = match args.first() {
                    Some(Value::Array(items)) => Some(items.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(SqlBridgeError::InvalidTask(format!(
                            "execute expects an array of parameters, got {other}"
                        )));
                    }
                };
                statement.execute(&mut **connection, params)?;
                Ok(Value::Bool(true))
            }
            StatementMethod::Fetch => Ok(statement.fetch().unwrap_or(Value::Bool(false))),
            StatementMethod::FetchAll => Ok(Value::Array(statement.fetch_all())),
            StatementMethod::FetchColumn => {
                let column = match args.first() {
                    Some(value) => value
                        .as_u64()
                        .and_then(|n| usize::try_from(n).ok())
                        .ok_or_else(|| {
                            SqlBridgeError::InvalidTask(format!("invalid column index {value}"))
                        })?,
                    None => 0,
                };
                Ok(statement.fetch_column(column).unwrap_or(Value::Bool(false)))
            }
            StatementMethod::BindValue => {
                let key = args.first().ok_or_else(|| missing_arg(method.as_str(), 0))?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                statement.bind_value(ParamKey::from_value(key)?, value)?;
                Ok(Value::Bool(true))
            }
            StatementMethod::BindParams => {
                match args.first() {
                    Some(Value::Object(map)) => {
                        for (name, value) in map {
                            let key = ParamKey::from_value(&Value::String(name.clone()))?;
                            statement.bind_value(key, value.clone())?;
                        }
                    }
                    Some(Value::Array(items)) => {
                        for (idx, value) in items.iter().enumerate() {
                            statement.bind_value(ParamKey::Position(idx + 1), value.clone())?;
                        }
                    }
                    _ => return Err(missing_arg(method.as_str(), 0)),
                }
                Ok(Value::Bool(true))
            }
            StatementMethod::RowCount => Ok(json!(statement.row_count())),
            StatementMethod::ColumnCount => Ok(json!(statement.column_count())),
            StatementMethod::CloseCursor => {
                statement.close_cursor();
                Ok(Value::Bool(true))
            }
            StatementMethod::Destroy => Ok(Value::Bool(false)),
        }
    }
}

impl<D: SyncDriver> Drop for WorkerHost<D> {
    fn drop(&mut self) {
        let open = self.registry.connection_count();
        if open > 0 {
            warn!(open, "worker host dropped with registered connections");
        }
        for pool in self.pools.values() {
            pool.shutdown();
        }
    }
}

fn missing_arg(operation: &str, idx: usize) -> SqlBridgeError {
    SqlBridgeError::InvalidTask(format!("{operation} expects argument {idx}"))
}

fn arg_str<'a>(args: &'a [Value], idx: usize, operation: &str) -> Result<&'a str, SqlBridgeError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_arg(operation, idx))
}
