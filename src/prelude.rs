//! Convenient imports for common functionality.

pub use crate::bridge::{Completion, PendingMarker, PollingClient, await_completion};
pub use crate::config::{BridgeOptions, BridgeOptionsBuilder};
pub use crate::dsn::ConnectParams;
pub use crate::error::{NativeError, SqlBridgeError, TxOp};
pub use crate::flow::{FlowId, FlowLocal};
pub use crate::polling::{Connector, PollingConnection, PollingDriver, PollingStatement};
pub use crate::pool::{BoundedPool, PoolStatus, Pooled, ResourceFactory, SharedPool, factory_fn};
pub use crate::retry::{Attempt, ErrorClass, Reconnect, RetryPolicy};
pub use crate::transaction::{TransactionState, TxAction};
pub use crate::worker::{
    FlowScope, ProcessWorkerFactory, RemoteConnection, RemoteStatement, SyncConnection, SyncDriver,
    SyncStatement, ThreadWorkerFactory, WorkerConnection, WorkerPool,
};

#[cfg(feature = "sqlite")]
pub use crate::worker::SqliteSyncDriver;
