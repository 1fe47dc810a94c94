//! Async-facing access to native SQL clients that were never written for an
//! event loop.
//!
//! Two kinds of client are covered:
//!
//! * polling-capable clients, which can start a query and report completion
//!   later. They are driven by [`polling::PollingDriver`] over a pool of
//!   physical links, with transparent reconnect-and-retry for transient
//!   errors.
//! * blocking-only clients, which are hosted in workers (threads or child
//!   processes) and addressed by string ids through
//!   [`worker::WorkerConnection`].
//!
//! Both share one bounded pool ([`pool`]), flow-scoped state ([`flow`]) and
//! nested transaction bookkeeping ([`transaction`]).

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod dsn;
pub mod error;
pub mod flow;
pub mod polling;
pub mod pool;
pub mod prelude;
pub mod retry;
pub mod transaction;
pub mod worker;

pub use config::{BridgeOptions, BridgeOptionsBuilder};
pub use error::{NativeError, SqlBridgeError, TxOp};
