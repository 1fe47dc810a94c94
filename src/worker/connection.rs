use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::driver::{ConnectArgs, INIT_STATEMENTS_OPTION};
use super::handle::WorkerHandle;
use super::pool::WorkerPool;
use super::proxy::{RemoteConnection, RemoteStatement};
use super::task::Task;
use crate::config::BridgeOptions;
use crate::dsn::ConnectParams;
use crate::error::SqlBridgeError;
use crate::flow::{FlowId, FlowLocal};
use crate::pool::ResourceFactory;
use crate::transaction::{TransactionState, TxAction};

#[derive(Debug, Default)]
struct FlowSlot {
    /// Shared with in-progress connects so concurrent callers open only one.
    connection: Arc<OnceCell<Arc<RemoteConnection>>>,
    transaction: TransactionState,
}

impl FlowSlot {
    fn is_vacant(&self) -> bool {
        !self.connection.initialized() && self.transaction == TransactionState::default()
    }
}

/// Connection facade for a synchronous-only client hosted in workers.
///
/// Each flow gets its own remote connection, opened on first use, plus its
/// own transaction state. With flow isolation off all flows share one.
pub struct WorkerConnection<F: ResourceFactory<Resource = WorkerHandle>> {
    params: ConnectParams,
    init_statements: Vec<String>,
    workers: WorkerPool<F>,
    flows: FlowLocal<FlowSlot>,
}

impl<F: ResourceFactory<Resource = WorkerHandle>> WorkerConnection<F> {
    /// # Errors
    ///
    /// `ConfigError` if the options are invalid or no DSN can be built.
    pub fn new(
        params: ConnectParams,
        workers: WorkerPool<F>,
        options: &BridgeOptions,
    ) -> Result<Self, SqlBridgeError> {
        options.validate()?;
        params.dsn()?;
        Ok(Self {
            params,
            init_statements: options.init_statements.clone(),
            workers,
            flows: FlowLocal::new(options.flow_isolation),
        })
    }

    fn connect_args(&self) -> Result<ConnectArgs, SqlBridgeError> {
        let mut options: std::collections::BTreeMap<String, String> = self
            .params
            .options
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        if !self.init_statements.is_empty() {
            options.insert(
                INIT_STATEMENTS_OPTION.to_string(),
                serde_json::to_string(&self.init_statements)?,
            );
        }
        Ok(ConnectArgs {
            dsn: self.params.dsn()?,
            username: self.params.username.clone(),
            password: self.params.password.clone(),
            options,
        })
    }

    /// The flow's remote connection, opening it on first use. Concurrent
    /// callers on one slot wait for a single connect.
    ///
    /// # Errors
    ///
    /// `PoolShutdown`, a worker error, or the native connect error.
    pub async fn connect(&self, flow: FlowId) -> Result<Arc<RemoteConnection>, SqlBridgeError> {
        let cell = self.flows.with(flow, |slot| Arc::clone(&slot.connection));
        match cell.get_or_try_init(|| self.open(flow)).await {
            Ok(remote) => Ok(Arc::clone(remote)),
            Err(err) => {
                // Keep the slot while other callers still wait on this cell.
                self.flows.prune(flow, |slot| {
                    Arc::ptr_eq(&slot.connection, &cell)
                        && Arc::strong_count(&cell) <= 2
                        && slot.is_vacant()
                });
                Err(err)
            }
        }
    }

    async fn open(&self, flow: FlowId) -> Result<Arc<RemoteConnection>, SqlBridgeError> {
        let args = self.connect_args()?;
        let worker = self.workers.lease().await?;
        let reply = worker.submit(Task::connect(args.to_args())).await?;
        let (id, driver_name) = match reply {
            Value::Array(parts) => match parts.as_slice() {
                [Value::String(id), Value::String(driver)] => (id.clone(), driver.to_lowercase()),
                _ => return Err(connect_reply_error(&Value::Array(parts))),
            },
            other => return Err(connect_reply_error(&other)),
        };
        debug!(%flow, connection = %id, driver = %driver_name, worker = worker.id(), "flow connected");
        Ok(Arc::new(RemoteConnection::new(id, driver_name, worker)))
    }

    #[must_use]
    pub fn is_connected(&self, flow: FlowId) -> bool {
        self.flows
            .read(flow, |slot| slot.is_some_and(|slot| slot.connection.initialized()))
    }

    /// Dialect of the flow's connection, once connected.
    #[must_use]
    pub fn driver_name(&self, flow: FlowId) -> Option<String> {
        self.flows.read(flow, |slot| {
            slot.and_then(|slot| slot.connection.get())
                .map(|connection| connection.driver_name().to_string())
        })
    }

    /// Forget the flow's connection and transaction state. The remote
    /// connection is destroyed once no statement or caller still holds it;
    /// an open transaction on it is rolled back.
    pub fn disconnect(&self, flow: FlowId) {
        self.flows.remove(flow);
    }

    /// A fresh flow that disconnects when dropped.
    ///
    /// With flow isolation off all flows share one slot, and dropping a
    /// scope leaves it connected.
    #[must_use]
    pub fn scope(&self) -> FlowScope<'_, F> {
        FlowScope {
            connection: self,
            id: FlowId::next(),
        }
    }

    /// Number of flows holding a connection or transaction state.
    #[must_use]
    pub fn open_flows(&self) -> usize {
        self.flows.len()
    }

    /// Prepare and execute `sql`.
    ///
    /// # Errors
    ///
    /// As [`RemoteConnection::query`].
    pub async fn execute(&self, flow: FlowId, sql: &str) -> Result<RemoteStatement, SqlBridgeError> {
        self.connect(flow).await?.query(sql).await
    }

    /// # Errors
    ///
    /// As [`RemoteConnection::prepare`].
    pub async fn prepare(&self, flow: FlowId, sql: &str) -> Result<RemoteStatement, SqlBridgeError> {
        self.connect(flow).await?.prepare(sql).await
    }

    /// # Errors
    ///
    /// As [`RemoteConnection::exec`].
    pub async fn exec(&self, flow: FlowId, sql: &str) -> Result<u64, SqlBridgeError> {
        self.connect(flow).await?.exec(sql).await
    }

    /// # Errors
    ///
    /// As [`RemoteConnection::quote`].
    pub async fn quote(&self, flow: FlowId, text: &str) -> Result<String, SqlBridgeError> {
        self.connect(flow).await?.quote(text).await
    }

    /// Last generated id. `pgsql` and `firebird` only report one for a named
    /// sequence; native failures read as no id.
    ///
    /// # Errors
    ///
    /// `PendingOperation` or a worker error.
    pub async fn last_insert_id(
        &self,
        flow: FlowId,
        sequence: Option<&str>,
    ) -> Result<Option<Value>, SqlBridgeError> {
        let connection = self.connect(flow).await?;
        if sequence.is_none() && matches!(connection.driver_name(), "pgsql" | "firebird") {
            return Ok(None);
        }
        match connection.last_insert_id(sequence).await {
            Ok(id) => Ok(id),
            Err(SqlBridgeError::Native(err)) => {
                debug!(%flow, error = %err, "lastInsertId unavailable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Schema (database) the flow's connection is using.
    ///
    /// # Errors
    ///
    /// As [`RemoteConnection::query`].
    pub async fn current_schema(&self, flow: FlowId) -> Result<Option<String>, SqlBridgeError> {
        let connection = self.connect(flow).await?;
        let sql = match connection.driver_name() {
            "sqlite" => return Ok(Some("main".to_string())),
            "mysql" => "SELECT DATABASE()",
            "sqlsrv" | "dblib" => "SELECT SCHEMA_NAME()",
            _ => "SELECT CURRENT_SCHEMA",
        };
        let statement = connection.query(sql).await?;
        Ok(match statement.fetch_column(0).await? {
            Some(Value::String(schema)) => Some(schema),
            _ => None,
        })
    }

    /// # Errors
    ///
    /// `RolledBackIncomplete` after an unwound inner rollback, or the remote error.
    pub async fn begin_transaction(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::begin).await
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction`, `RolledBackIncomplete`, or the remote error.
    pub async fn commit(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::commit).await
    }

    /// # Errors
    ///
    /// `AsymmetricTransaction`, or the remote error.
    pub async fn rollback(&self, flow: FlowId) -> Result<(), SqlBridgeError> {
        self.transition(flow, TransactionState::rollback).await
    }

    #[must_use]
    pub fn transaction_state(&self, flow: FlowId) -> TransactionState {
        self.flows
            .read(flow, |slot| slot.map(|slot| slot.transaction).unwrap_or_default())
    }

    #[must_use]
    pub fn in_transaction(&self, flow: FlowId) -> bool {
        self.transaction_state(flow).depth() > 0
    }

    async fn transition(
        &self,
        flow: FlowId,
        step: fn(&mut TransactionState) -> Result<TxAction, SqlBridgeError>,
    ) -> Result<(), SqlBridgeError> {
        let mut state = self.transaction_state(flow);
        match step(&mut state)? {
            TxAction::IssueBegin => self.connect(flow).await?.begin_transaction().await?,
            TxAction::IssueCommit => self.connect(flow).await?.commit().await?,
            TxAction::IssueRollback => self.connect(flow).await?.roll_back().await?,
            TxAction::Nested => {}
        }
        self.flows.with(flow, |slot| slot.transaction = state);
        self.flows.prune(flow, FlowSlot::is_vacant);
        Ok(())
    }

    #[must_use]
    pub fn workers(&self) -> &WorkerPool<F> {
        &self.workers
    }
}

/// One flow of a [`WorkerConnection`], from [`WorkerConnection::scope`].
pub struct FlowScope<'a, F: ResourceFactory<Resource = WorkerHandle>> {
    connection: &'a WorkerConnection<F>,
    id: FlowId,
}

impl<F: ResourceFactory<Resource = WorkerHandle>> FlowScope<'_, F> {
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.id
    }
}

impl<F: ResourceFactory<Resource = WorkerHandle>> Drop for FlowScope<'_, F> {
    fn drop(&mut self) {
        if self.connection.flows.is_isolated() {
            self.connection.disconnect(self.id);
        }
    }
}

fn connect_reply_error(value: &Value) -> SqlBridgeError {
    SqlBridgeError::WorkerError(format!("unexpected reply to connect: {value}"))
}
