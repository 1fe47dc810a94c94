use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PoolStatus;
use super::factory::ResourceFactory;
use crate::error::SqlBridgeError;

pub(crate) type ResourceId = u64;

/// How borrowers share resources.
pub(crate) enum Checkout<R> {
    /// One borrower per resource; released resources go to the oldest waiter or idle.
    Exclusive,
    /// Many borrowers per resource; the least-loaded one is cloned out.
    Shared(fn(&R) -> R),
}

pub(crate) struct Slot<R> {
    pub(crate) id: ResourceId,
    pub(crate) resource: R,
}

type Delivery<R> = Result<Slot<R>, SqlBridgeError>;

struct Waiter<R> {
    id: u64,
    tx: oneshot::Sender<Delivery<R>>,
}

struct PoolState<R> {
    /// Live set with outstanding borrow counts.
    borrows: BTreeMap<ResourceId, usize>,
    idle: VecDeque<Slot<R>>,
    shared: BTreeMap<ResourceId, R>,
    waiters: VecDeque<Waiter<R>>,
    pending: usize,
    next_waiter: u64,
}

impl<R> PoolState<R> {
    fn enqueue(&mut self) -> (u64, oneshot::Receiver<Delivery<R>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.push_back(Waiter { id, tx });
        (id, rx)
    }

    fn take_waiter(&mut self, id: u64) -> Option<Waiter<R>> {
        let pos = self.waiters.iter().position(|waiter| waiter.id == id)?;
        self.waiters.remove(pos)
    }

    fn fail_waiter(&mut self, id: u64, err: SqlBridgeError) {
        if let Some(waiter) = self.take_waiter(id) {
            let _ = waiter.tx.send(Err(err));
        }
    }

    fn set_borrows(&mut self, id: ResourceId, count: usize) {
        self.borrows.insert(id, count);
    }

    fn least_loaded(&self) -> Option<ResourceId> {
        self.shared
            .keys()
            .min_by_key(|id| self.borrows.get(id).copied().unwrap_or(0))
            .copied()
    }
}

enum Ticket<R> {
    Ready(Slot<R>),
    Wait(u64, oneshot::Receiver<Delivery<R>>),
}

pub(crate) struct PoolInner<F: ResourceFactory> {
    factory: F,
    limit: usize,
    checkout: Checkout<F::Resource>,
    label: String,
    cancel: CancellationToken,
    next_id: AtomicU64,
    state: Mutex<PoolState<F::Resource>>,
}

impl<F: ResourceFactory> PoolInner<F> {
    pub(crate) fn new(
        factory: F,
        limit: usize,
        checkout: Checkout<F::Resource>,
        label: String,
    ) -> Result<Self, SqlBridgeError> {
        if limit == 0 {
            return Err(SqlBridgeError::ConfigError(
                "pool limit must be greater than zero".into(),
            ));
        }
        Ok(Self {
            factory,
            limit,
            checkout,
            label,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState {
                borrows: BTreeMap::new(),
                idle: VecDeque::new(),
                shared: BTreeMap::new(),
                waiters: VecDeque::new(),
                pending: 0,
                next_waiter: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub(crate) async fn acquire_exclusive(
        self: &Arc<Self>,
    ) -> Result<Slot<F::Resource>, SqlBridgeError> {
        let (ticket, dead) = {
            let mut state = self.lock();
            if self.cancel.is_cancelled() {
                return Err(SqlBridgeError::pool_shutdown());
            }
            let mut dead = Vec::new();
            let mut ready = None;
            while let Some(slot) = state.idle.pop_front() {
                if self.factory.is_alive(&slot.resource) {
                    ready = Some(slot);
                    break;
                }
                state.borrows.remove(&slot.id);
                dead.push(slot);
            }
            let ticket = match ready {
                Some(slot) => {
                    state.set_borrows(slot.id, 1);
                    Ticket::Ready(slot)
                }
                None => {
                    let (waiter, rx) = state.enqueue();
                    self.maybe_create(&mut state, waiter);
                    Ticket::Wait(waiter, rx)
                }
            };
            (ticket, dead)
        };
        drop(dead);
        self.settle(ticket).await
    }

    pub(crate) async fn acquire_shared(
        self: &Arc<Self>,
    ) -> Result<Slot<F::Resource>, SqlBridgeError> {
        let Checkout::Shared(clone) = self.checkout else {
            return Err(SqlBridgeError::ConfigError(format!(
                "pool {} does not support shared checkout",
                self.label
            )));
        };
        let (ticket, dead) = {
            let mut state = self.lock();
            if self.cancel.is_cancelled() {
                return Err(SqlBridgeError::pool_shutdown());
            }
            let dead = self.prune_dead_shared(&mut state);
            let ticket = if state.borrows.len() + state.pending < self.limit {
                let (waiter, rx) = state.enqueue();
                self.maybe_create(&mut state, waiter);
                Ticket::Wait(waiter, rx)
            } else if let Some(id) = state.least_loaded()
                && let Some(resource) = state.shared.get(&id).map(clone)
            {
                *state.borrows.entry(id).or_insert(0) += 1;
                Ticket::Ready(Slot { id, resource })
            } else {
                let (waiter, rx) = state.enqueue();
                Ticket::Wait(waiter, rx)
            };
            (ticket, dead)
        };
        drop(dead);
        self.settle(ticket).await
    }

    async fn settle(
        self: &Arc<Self>,
        ticket: Ticket<F::Resource>,
    ) -> Result<Slot<F::Resource>, SqlBridgeError> {
        match ticket {
            Ticket::Ready(slot) => Ok(slot),
            Ticket::Wait(id, rx) => {
                WaitGuard {
                    pool: Arc::clone(self),
                    id,
                    rx,
                    settled: false,
                }
                .wait()
                .await
            }
        }
    }

    fn maybe_create(self: &Arc<Self>, state: &mut PoolState<F::Resource>, trigger: u64) {
        if state.borrows.len() + state.pending >= self.limit {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(pool = %self.label, "no async runtime to create a resource on");
            state.fail_waiter(
                trigger,
                SqlBridgeError::ConfigError(
                    "a tokio runtime is required to create pooled resources".into(),
                ),
            );
            return;
        };
        state.pending += 1;
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            let token = inner.cancel.child_token();
            let created = tokio::select! {
                () = token.cancelled() => Err(SqlBridgeError::PoolShutdown(
                    "The pool shut down before the resource could be created".into(),
                )),
                result = inner.factory.create(token.clone()) => result,
            };
            inner.finish_creation(trigger, created);
        });
    }

    fn finish_creation(
        self: &Arc<Self>,
        trigger: u64,
        created: Result<F::Resource, SqlBridgeError>,
    ) {
        let mut discarded = Vec::new();
        {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            match created {
                Ok(resource) if self.cancel.is_cancelled() => {
                    discarded.push(resource);
                    state.fail_waiter(trigger, SqlBridgeError::pool_shutdown());
                }
                Ok(resource) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    state.set_borrows(id, 0);
                    debug!(
                        pool = %self.label,
                        resource = id,
                        live = state.borrows.len(),
                        "created pooled resource"
                    );
                    match self.checkout {
                        Checkout::Exclusive => self.hand_off(&mut state, Slot { id, resource }),
                        Checkout::Shared(clone) => {
                            state.shared.insert(id, resource);
                            Self::serve_shared(&mut state, clone);
                        }
                    }
                }
                Err(err) if self.cancel.is_cancelled() => state.fail_waiter(trigger, err),
                Err(err) => {
                    warn!(
                        pool = %self.label,
                        error = %err,
                        "resource creation failed; shutting the pool down"
                    );
                    state.fail_waiter(trigger, err);
                    discarded = self.shutdown_locked(&mut state);
                }
            }
        }
        drop(discarded);
    }

    /// Give an exclusive resource to the oldest live waiter, or park it as idle.
    fn hand_off(&self, state: &mut PoolState<F::Resource>, mut slot: Slot<F::Resource>) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.set_borrows(slot.id, 1);
            match waiter.tx.send(Ok(slot)) {
                Ok(()) => return,
                Err(Ok(returned)) => slot = returned,
                Err(Err(_)) => return,
            }
        }
        state.set_borrows(slot.id, 0);
        state.idle.push_back(slot);
    }

    fn serve_shared(state: &mut PoolState<F::Resource>, clone: fn(&F::Resource) -> F::Resource) {
        while !state.waiters.is_empty() {
            let Some(id) = state.least_loaded() else {
                return;
            };
            let Some(resource) = state.shared.get(&id).map(clone) else {
                return;
            };
            let Some(waiter) = state.waiters.pop_front() else {
                return;
            };
            *state.borrows.entry(id).or_insert(0) += 1;
            if waiter.tx.send(Ok(Slot { id, resource })).is_err()
                && let Some(count) = state.borrows.get_mut(&id)
            {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn prune_dead_shared(&self, state: &mut PoolState<F::Resource>) -> Vec<F::Resource> {
        let dead: Vec<ResourceId> = state
            .shared
            .iter()
            .filter(|(_, resource)| !self.factory.is_alive(resource))
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            state.borrows.remove(&id);
            if let Some(resource) = state.shared.remove(&id) {
                debug!(pool = %self.label, resource = id, "pruned dead shared resource");
                removed.push(resource);
            }
        }
        removed
    }

    /// Return an exclusive borrow.
    pub(crate) fn release(self: &Arc<Self>, slot: Slot<F::Resource>) {
        let dropped = {
            let mut state = self.lock();
            self.release_locked(&mut state, slot)
        };
        drop(dropped);
    }

    fn release_locked(
        self: &Arc<Self>,
        state: &mut PoolState<F::Resource>,
        slot: Slot<F::Resource>,
    ) -> Option<Slot<F::Resource>> {
        if self.cancel.is_cancelled() {
            state.borrows.remove(&slot.id);
            return Some(slot);
        }
        if !self.factory.is_alive(&slot.resource) {
            debug!(pool = %self.label, resource = slot.id, "dropping dead resource on release");
            state.borrows.remove(&slot.id);
            self.replenish(state);
            return Some(slot);
        }
        self.hand_off(state, slot);
        None
    }

    /// Remove a broken exclusive resource from the live set.
    pub(crate) fn discard(self: &Arc<Self>, slot: Slot<F::Resource>) {
        {
            let mut state = self.lock();
            state.borrows.remove(&slot.id);
            debug!(pool = %self.label, resource = slot.id, "discarded pooled resource");
            self.replenish(&mut state);
        }
        drop(slot);
    }

    /// Return one shared borrow.
    pub(crate) fn release_shared(self: &Arc<Self>, id: ResourceId) {
        let dropped = {
            let mut state = self.lock();
            if let Some(count) = state.borrows.get_mut(&id) {
                *count = count.saturating_sub(1);
            }
            let dead = self.cancel.is_cancelled()
                || state
                    .shared
                    .get(&id)
                    .is_some_and(|resource| !self.factory.is_alive(resource));
            if dead {
                state.borrows.remove(&id);
                let removed = state.shared.remove(&id);
                self.replenish(&mut state);
                removed
            } else {
                None
            }
        };
        drop(dropped);
    }

    /// Start a creation for the oldest waiter if there is room for one.
    fn replenish(self: &Arc<Self>, state: &mut PoolState<F::Resource>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(trigger) = state.waiters.front().map(|waiter| waiter.id) {
            self.maybe_create(state, trigger);
        }
    }

    pub(crate) fn shutdown(&self) {
        let drained = {
            let mut state = self.lock();
            self.shutdown_locked(&mut state)
        };
        drop(drained);
    }

    fn shutdown_locked(&self, state: &mut PoolState<F::Resource>) -> Vec<F::Resource> {
        self.cancel.cancel();
        let waiting = state.waiters.len();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(SqlBridgeError::pool_shutdown()));
        }
        let mut drained = Vec::with_capacity(state.idle.len() + state.shared.len());
        while let Some(slot) = state.idle.pop_front() {
            state.borrows.remove(&slot.id);
            drained.push(slot.resource);
        }
        for (id, resource) in std::mem::take(&mut state.shared) {
            state.borrows.remove(&id);
            drained.push(resource);
        }
        debug!(
            pool = %self.label,
            waiting,
            dropped = drained.len(),
            "pool shut down"
        );
        drained
    }

    pub(crate) fn live_shared(&self) -> Vec<F::Resource> {
        let Checkout::Shared(clone) = self.checkout else {
            return Vec::new();
        };
        self.lock().shared.values().map(clone).collect()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.lock();
        let idle = match self.checkout {
            Checkout::Exclusive => state.idle.len(),
            Checkout::Shared(_) => state
                .shared
                .keys()
                .filter(|id| state.borrows.get(id).copied().unwrap_or(0) == 0)
                .count(),
        };
        PoolStatus {
            limit: self.limit,
            live: state.borrows.len(),
            pending: state.pending,
            idle,
            waiting: state.waiters.len(),
            running: !self.cancel.is_cancelled(),
        }
    }
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes its waiter from the queue if the acquiring future is dropped early.
struct WaitGuard<F: ResourceFactory> {
    pool: Arc<PoolInner<F>>,
    id: u64,
    rx: oneshot::Receiver<Delivery<F::Resource>>,
    settled: bool,
}

impl<F: ResourceFactory> WaitGuard<F> {
    async fn wait(mut self) -> Result<Slot<F::Resource>, SqlBridgeError> {
        let delivery = (&mut self.rx).await;
        self.settled = true;
        delivery.unwrap_or_else(|_| Err(SqlBridgeError::pool_shutdown()))
    }
}

impl<F: ResourceFactory> Drop for WaitGuard<F> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut dropped = None;
        {
            let mut state = self.pool.lock();
            if state.take_waiter(self.id).is_some() {
                debug!(pool = %self.pool.label, waiter = self.id, "cancelled pool wait");
            } else if let Ok(Ok(slot)) = self.rx.try_recv() {
                // Delivered after the caller stopped waiting.
                match self.pool.checkout {
                    Checkout::Exclusive => dropped = self.pool.release_locked(&mut state, slot),
                    Checkout::Shared(_) => {
                        if let Some(count) = state.borrows.get_mut(&slot.id) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
        }
        drop(dropped);
    }
}
