//! Driving a polling-capable native client.
//!
//! Physical links live in a [`BoundedPool`]; each borrow is a
//! [`PollingConnection`] whose executions go through the shared
//! [`RetryPolicy`] and the suspension bridge. Transaction state is kept per
//! flow on the driver, not on the link.

mod connection;
mod link;
mod statement;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use connection::PollingConnection;
pub use link::{LinkFactory, PhysicalLink, SharedLink};
pub use statement::{PollingStatement, SqlAttempt};

use crate::bridge::PollingClient;
use crate::config::BridgeOptions;
use crate::error::SqlBridgeError;
use crate::flow::FlowLocal;
use crate::pool::{BoundedPool, PoolStatus};
use crate::retry::RetryPolicy;
use crate::transaction::TransactionState;

/// Opens native clients; called for every new link and every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: PollingClient;

    /// # Errors
    ///
    /// Whatever prevents the client from connecting.
    async fn connect(&self, cancel: &CancellationToken) -> Result<Self::Client, SqlBridgeError>;
}

/// Entry point for the polling path: a link pool plus per-flow transaction state.
pub struct PollingDriver<K: Connector> {
    links: BoundedPool<LinkFactory<K>>,
    retry: Arc<RetryPolicy>,
    transactions: Arc<FlowLocal<TransactionState>>,
}

impl<K: Connector> PollingDriver<K> {
    /// # Errors
    ///
    /// `ConfigError` if the options are invalid.
    pub fn new(connector: K, options: &BridgeOptions) -> Result<Self, SqlBridgeError> {
        Self::with_retry_policy(connector, options, RetryPolicy::new(options.max_retries))
    }

    /// # Errors
    ///
    /// `ConfigError` if the options are invalid.
    pub fn with_retry_policy(
        connector: K,
        options: &BridgeOptions,
        retry: RetryPolicy,
    ) -> Result<Self, SqlBridgeError> {
        options.validate()?;
        let factory = LinkFactory::new(connector, options.init_statements.clone());
        Ok(Self {
            links: BoundedPool::with_label(factory, options.pool_limit, "links")?,
            retry: Arc::new(retry),
            transactions: Arc::new(FlowLocal::new(options.flow_isolation)),
        })
    }

    /// Borrow a link as a connection; the link returns to the pool when it drops.
    ///
    /// # Errors
    ///
    /// `PoolShutdown`, or the connector's error for a fresh link.
    pub async fn connection(&self) -> Result<PollingConnection<K>, SqlBridgeError> {
        let link = self.links.acquire().await?;
        Ok(PollingConnection::new(
            link,
            Arc::clone(&self.retry),
            Arc::clone(&self.transactions),
        ))
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.links.status()
    }

    pub fn shutdown(&self) {
        self.links.shutdown();
    }
}
