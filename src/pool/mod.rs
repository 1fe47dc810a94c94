//! Generic bounded-concurrency resource pool.
//!
//! One implementation serves every pooled thing in the crate: physical links
//! for polling clients, worker handles, and native connections inside a
//! worker. [`BoundedPool`] lends each resource to one borrower at a time;
//! [`SharedPool`] lends the least-loaded resource to many borrowers at once.
//!
//! Creation is lazy and bounded: `live + pending` never exceeds the limit.
//! Waiters are served strictly in arrival order. A factory failure fails the
//! waiter that triggered it and shuts the whole pool down.

mod factory;
mod handle;
mod inner;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

pub use factory::{FnFactory, ResourceFactory, factory_fn};
pub use handle::{Pooled, SharedPooled};

use self::inner::{Checkout, PoolInner};
use crate::error::SqlBridgeError;

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub limit: usize,
    /// Resources created and not yet discarded.
    pub live: usize,
    /// Creations in flight.
    pub pending: usize,
    /// Live resources with no borrower.
    pub idle: usize,
    /// Callers queued for a resource.
    pub waiting: usize,
    pub running: bool,
}

impl PoolStatus {
    /// True when an acquire could be served without waiting on a release.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle > 0 || self.live + self.pending < self.limit
    }
}

/// Pool lending each resource to exactly one borrower at a time.
pub struct BoundedPool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for BoundedPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> BoundedPool<F> {
    /// # Errors
    ///
    /// `SqlBridgeError::ConfigError` if `limit` is zero.
    pub fn new(factory: F, limit: usize) -> Result<Self, SqlBridgeError> {
        Self::with_label(factory, limit, "pool")
    }

    /// Like [`BoundedPool::new`], naming the pool in log output.
    ///
    /// # Errors
    ///
    /// `SqlBridgeError::ConfigError` if `limit` is zero.
    pub fn with_label(
        factory: F,
        limit: usize,
        label: impl Into<String>,
    ) -> Result<Self, SqlBridgeError> {
        let inner = PoolInner::new(factory, limit, Checkout::Exclusive, label.into())?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Borrow a resource, waiting for a creation or a release when none is idle.
    ///
    /// Dropping the returned future before it resolves leaves the queue as if
    /// the call had never been made.
    ///
    /// # Errors
    ///
    /// `PoolShutdown` after shutdown, or the factory's error when the creation
    /// started for this call fails.
    pub async fn acquire(&self) -> Result<Pooled<F>, SqlBridgeError> {
        let slot = self.inner.acquire_exclusive().await?;
        Ok(Pooled::new(Arc::clone(&self.inner), slot))
    }

    /// Fail every waiter and in-flight creation and drop idle resources.
    /// Borrowed resources are dropped when their borrowers release them.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    #[must_use]
    pub fn factory(&self) -> &F {
        self.inner.factory()
    }
}

impl<F: ResourceFactory> fmt::Debug for BoundedPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("label", &self.inner.label())
            .field("status", &self.status())
            .finish()
    }
}

/// Pool lending the least-loaded resource to any number of borrowers.
pub struct SharedPool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for SharedPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> SharedPool<F>
where
    F: ResourceFactory,
    F::Resource: Clone,
{
    /// # Errors
    ///
    /// `SqlBridgeError::ConfigError` if `limit` is zero.
    pub fn new(factory: F, limit: usize, label: impl Into<String>) -> Result<Self, SqlBridgeError> {
        let clone: fn(&F::Resource) -> F::Resource = Clone::clone;
        let inner = PoolInner::new(factory, limit, Checkout::Shared(clone), label.into())?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Borrow a resource: a fresh one while under the limit, otherwise the
    /// live resource with the fewest outstanding borrows.
    ///
    /// # Errors
    ///
    /// `PoolShutdown` after shutdown, or the factory's error.
    pub async fn acquire(&self) -> Result<SharedPooled<F>, SqlBridgeError> {
        let slot = self.inner.acquire_shared().await?;
        Ok(SharedPooled::new(Arc::clone(&self.inner), slot))
    }

    /// Clones of every live resource.
    #[must_use]
    pub fn live(&self) -> Vec<F::Resource> {
        self.inner.live_shared()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }
}
