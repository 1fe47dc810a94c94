use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::factory::ResourceFactory;
use super::inner::{PoolInner, ResourceId, Slot};

/// Exclusive borrow of a pooled resource. Returns it to the pool on drop.
pub struct Pooled<F: ResourceFactory> {
    slot: Option<Slot<F::Resource>>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Pooled<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, slot: Slot<F::Resource>) -> Self {
        Self {
            slot: Some(slot),
            pool,
        }
    }

    /// Pool-assigned identity of the borrowed resource.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map_or(0, |slot| slot.id)
    }

    /// Drop the resource instead of returning it, freeing its slot for a replacement.
    pub fn discard(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.discard(slot);
        }
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self
            .slot
            .as_ref()
            .expect("pooled resource is present until drop")
            .resource
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .slot
            .as_mut()
            .expect("pooled resource is present until drop")
            .resource
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.label())
            .field("id", &self.id())
            .finish()
    }
}

/// One of possibly many concurrent borrows of a shared resource.
pub struct SharedPooled<F: ResourceFactory> {
    id: ResourceId,
    resource: F::Resource,
    pool: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> SharedPooled<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, slot: Slot<F::Resource>) -> Self {
        Self {
            id: slot.id,
            resource: slot.resource,
            pool,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<F: ResourceFactory> Deref for SharedPooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<F: ResourceFactory> Drop for SharedPooled<F> {
    fn drop(&mut self) {
        self.pool.release_shared(self.id);
    }
}

impl<F: ResourceFactory> fmt::Debug for SharedPooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPooled")
            .field("pool", &self.pool.label())
            .field("id", &self.id)
            .finish()
    }
}
