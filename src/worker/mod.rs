//! Driving a blocking-only native client through workers.
//!
//! A worker is a dedicated thread ([`ThreadChannel`]) or a child process
//! ([`ProcessChannel`]) that runs a [`WorkerHost`]. The host owns the native
//! connections and statements, keyed by string ids, and answers one [`Task`]
//! at a time. On the caller side a [`WorkerPool`] hands out workers, and
//! [`RemoteConnection`] / [`RemoteStatement`] stand in for the objects that
//! live inside them. [`WorkerConnection`] adds per-flow connections and
//! transaction nesting on top.
//!
//! Wire format, one JSON document per line:
//!
//! ```text
//! -> {"operation":"pdo:query","args":["SELECT 1"],"targetId":"1:pdo"}
//! <- {"value":"1:1:stmt"}
//! <- {"error":{"kind":"not_found","message":"PDO resource not found '9:pdo'"}}
//! ```
//!
//! The literal line `null` ends a worker's task loop.

mod channel;
mod connection;
mod driver;
mod handle;
mod host;
mod pool;
mod process;
mod proxy;
mod registry;
#[cfg(feature = "sqlite")]
mod sqlite;
mod task;

pub use channel::{ERROR_TIMEOUT, ThreadChannel, WorkerChannel};
pub use connection::{FlowScope, WorkerConnection};
pub use driver::{
    ConnectArgs, INIT_STATEMENTS_OPTION, ParamKey, SyncConnection, SyncDriver, SyncStatement,
};
pub use handle::{ProcessWorkerFactory, ThreadWorkerFactory, WorkerHandle};
pub use host::{NativeFactory, WorkerHost};
pub use pool::{WorkerLease, WorkerPool};
pub use process::{END_OF_TASKS, ProcessChannel, serve, serve_stdio};
pub use proxy::{RemoteConnection, RemoteStatement};
pub use registry::{ConnectionId, Registry, StatementId};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteSyncConnection, SqliteSyncDriver, SqliteSyncStatement};
pub use task::{ConnectionMethod, Operation, RemoteError, StatementMethod, Task, TaskReply};
