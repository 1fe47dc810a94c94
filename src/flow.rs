//! Identity and storage for logical flows of execution.
//!
//! A flow is whatever unit of cooperative work the caller treats as one
//! conversation with the database (a request handler, a job). Per-flow state
//! is keyed explicitly by [`FlowId`] rather than read from task-local storage,
//! so the same physical connection can serve unrelated flows in sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

static NEXT_FLOW: AtomicU64 = AtomicU64::new(1);

/// Identifier of one logical flow of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl FlowId {
    /// Slot used for every flow when isolation is disabled.
    pub const SHARED: FlowId = FlowId(0);

    /// Allocate a fresh, process-unique flow id.
    #[must_use]
    pub fn next() -> Self {
        FlowId(NEXT_FLOW.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Map of per-flow values; with isolation off all flows resolve to one slot.
#[derive(Debug)]
pub struct FlowLocal<T> {
    isolated: bool,
    slots: Mutex<HashMap<FlowId, T>>,
}

impl<T: Default> FlowLocal<T> {
    #[must_use]
    pub fn new(isolated: bool) -> Self {
        Self {
            isolated,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    fn key(&self, flow: FlowId) -> FlowId {
        if self.isolated { flow } else { FlowId::SHARED }
    }

    /// Run `f` against the flow's slot, creating it on first use.
    ///
    /// The lock is held only for the duration of `f`; never await inside it.
    pub fn with<R>(&self, flow: FlowId, f: impl FnOnce(&mut T) -> R) -> R {
        let key = self.key(flow);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f(slots.entry(key).or_default())
    }

    /// Run `f` against the flow's slot if it exists. Never creates one.
    pub fn read<R>(&self, flow: FlowId, f: impl FnOnce(Option<&T>) -> R) -> R {
        let key = self.key(flow);
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f(slots.get(&key))
    }

    /// Drop the flow's slot if `vacant` holds for it.
    pub fn prune(&self, flow: FlowId, vacant: impl FnOnce(&T) -> bool) -> bool {
        let key = self.key(flow);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&key).is_some_and(vacant) {
            slots.remove(&key);
            true
        } else {
            false
        }
    }

    /// Drop the flow's slot, returning its value.
    pub fn remove(&self, flow: FlowId) -> Option<T> {
        let key = self.key(flow);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Default + Clone> FlowLocal<T> {
    #[must_use]
    pub fn get(&self, flow: FlowId) -> T {
        let key = self.key(flow);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}

impl<T: Default + PartialEq> FlowLocal<T> {
    /// Store `value`, pruning the slot once it is back to its default.
    pub fn set(&self, flow: FlowId, value: T) {
        let key = self.key(flow);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if value == T::default() {
            slots.remove(&key);
        } else {
            slots.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_flows_have_separate_slots() {
        let local: FlowLocal<u32> = FlowLocal::new(true);
        let (a, b) = (FlowId::next(), FlowId::next());
        local.set(a, 3);
        assert_eq!(local.get(a), 3);
        assert_eq!(local.get(b), 0);
        local.set(a, 0);
        assert!(local.is_empty());
    }

    #[test]
    fn reads_do_not_create_slots() {
        let local: FlowLocal<u32> = FlowLocal::new(true);
        for _ in 0..100 {
            let flow = FlowId::next();
            assert_eq!(local.read(flow, |slot| slot.copied()), None);
            assert_eq!(local.get(flow), 0);
        }
        assert!(local.is_empty());
    }

    #[test]
    fn prune_only_drops_vacant_slots() {
        let local: FlowLocal<u32> = FlowLocal::new(true);
        let flow = FlowId::next();
        local.with(flow, |v| *v = 1);
        assert!(!local.prune(flow, |v| *v == 0));
        assert_eq!(local.len(), 1);
        local.with(flow, |v| *v = 0);
        assert!(local.prune(flow, |v| *v == 0));
        assert!(local.is_empty());
        assert!(!local.prune(FlowId::next(), |_| true));
    }

    #[test]
    fn shared_mode_collapses_flows() {
        let local: FlowLocal<u32> = FlowLocal::new(false);
        let (a, b) = (FlowId::next(), FlowId::next());
        local.with(a, |v| *v += 2);
        assert_eq!(local.get(b), 2);
    }
}
