use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::warn;

use super::handle::WorkerHandle;
use crate::error::SqlBridgeError;
use crate::pool::{PoolStatus, ResourceFactory, SharedPool};

/// A worker borrowed from a [`WorkerPool`]. Clones share the borrow, which
/// ends when the last clone drops.
#[derive(Clone)]
pub struct WorkerLease {
    worker: WorkerHandle,
    _borrow: Arc<dyn Any + Send + Sync>,
}

impl Deref for WorkerLease {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.worker
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerLease").field(&self.worker).finish()
    }
}

/// Hands out the least-loaded live worker, starting new ones lazily up to the limit.
pub struct WorkerPool<F: ResourceFactory<Resource = WorkerHandle>> {
    workers: SharedPool<F>,
}

impl<F: ResourceFactory<Resource = WorkerHandle>> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            workers: self.workers.clone(),
        }
    }
}

impl<F: ResourceFactory<Resource = WorkerHandle>> WorkerPool<F> {
    /// # Errors
    ///
    /// `ConfigError` if `limit` is zero.
    pub fn new(factory: F, limit: usize) -> Result<Self, SqlBridgeError> {
        Ok(Self {
            workers: SharedPool::new(factory, limit, "workers")?,
        })
    }

    /// # Errors
    ///
    /// `PoolShutdown`, or the factory's error starting a worker.
    pub async fn lease(&self) -> Result<WorkerLease, SqlBridgeError> {
        let borrowed = self.workers.acquire().await?;
        Ok(WorkerLease {
            worker: (*borrowed).clone(),
            _borrow: Arc::new(borrowed),
        })
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.workers.status()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.workers.is_running()
    }

    /// Stop handing out workers, then shut every live worker down.
    pub async fn shutdown(&self) {
        let live = self.workers.live();
        self.workers.shutdown();
        for worker in live {
            if let Err(err) = worker.shutdown().await {
                warn!(worker = worker.id(), error = %err, "worker shutdown escalated");
            }
        }
    }

    /// Kill every live worker without waiting.
    pub fn kill(&self) {
        let live = self.workers.live();
        self.workers.shutdown();
        for worker in live {
            worker.kill();
        }
    }
}
