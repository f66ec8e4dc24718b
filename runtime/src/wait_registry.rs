//! Tracks in-flight actions so the Store facade can answer `isWaiting` and
//! power the `wait*` family of coordination predicates.
//!
//! Two independent indexes are kept, as the source keeps them: one counts
//! in-flight dispatches per *action type* (`isWaiting(Type)`), the other
//! tracks a single current holder per *lock key* (used by the mixin gates
//! in [`crate::mixins`] and the optimistic-sync algorithms in
//! [`crate::optimistic`]).

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Mutex;

use flux_core::action::LockKey;
use tokio::sync::Notify;

/// A ticket returned by [`WaitRegistry::enter`]; dropping it (or calling
/// [`Ticket::finish`] explicitly) decrements the type counter and notifies
/// anyone blocked in `wait_*`.
#[must_use]
pub struct Ticket<'a> {
    registry: &'a WaitRegistry,
    type_id: TypeId,
    finished: bool,
}

impl Ticket<'_> {
    /// Mark the dispatch as finished. Equivalent to dropping the ticket, but
    /// explicit at the executor's call site.
    pub fn finish(mut self) {
        self.finished = true;
        self.registry.leave(self.type_id);
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.leave(self.type_id);
        }
    }
}

/// Tracks how many dispatches of each action type are currently in flight,
/// plus which lock keys are currently held by a mixin gate.
pub struct WaitRegistry {
    by_type: Mutex<HashMap<TypeId, usize>>,
    by_key: Mutex<HashMap<LockKey, ()>>,
    notify: Notify,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    /// An empty registry: no action type and no lock key is in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_type: Mutex::new(HashMap::new()),
            by_key: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Record that a dispatch of `type_id` has started. Returns a ticket
    /// that must be dropped (or [`Ticket::finish`]ed) when the dispatch's
    /// `after` phase completes.
    pub fn enter(&self, type_id: TypeId) -> Ticket<'_> {
        {
            let mut by_type = self.by_type.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *by_type.entry(type_id).or_insert(0) += 1;
        }
        self.notify.notify_waiters();
        Ticket {
            registry: self,
            type_id,
            finished: false,
        }
    }

    fn leave(&self, type_id: TypeId) {
        {
            let mut by_type = self.by_type.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(count) = by_type.get_mut(&type_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    by_type.remove(&type_id);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Whether any dispatch of `type_id` is currently in flight.
    #[must_use]
    pub fn is_waiting_type(&self, type_id: TypeId) -> bool {
        self.by_type
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&type_id)
            .is_some_and(|&count| count > 0)
    }

    /// Whether any action type at all is currently in flight (used by
    /// `waitAllActions` without a type filter).
    #[must_use]
    pub fn is_any_waiting(&self) -> bool {
        !self
            .by_type
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty()
    }

    /// A snapshot of every action type currently in flight. Used by
    /// `waitActionCondition`, whose predicate is evaluated over the whole
    /// in-flight set rather than a single type.
    #[must_use]
    pub fn in_flight_types(&self) -> Vec<TypeId> {
        self.by_type
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Attempt to claim `key` exclusively. Returns `false` if it is already
    /// held (used by `NonReentrant`).
    #[must_use]
    pub fn try_hold(&self, key: LockKey) -> bool {
        let mut by_key = self.by_key.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if by_key.contains_key(&key) {
            false
        } else {
            by_key.insert(key, ());
            true
        }
    }

    /// Release a key claimed via [`Self::try_hold`].
    pub fn release(&self, key: &LockKey) {
        self.by_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        self.notify.notify_waiters();
    }

    /// Whether `key` is currently held.
    #[must_use]
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.by_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(key)
    }

    /// Block until `predicate` holds, re-checking every time any dispatch
    /// starts or finishes. Used by the `wait_*` family before a timeout is
    /// applied by the caller.
    pub async fn wait_until(&self, mut predicate: impl FnMut() -> bool) {
        loop {
            if predicate() {
                return;
            }
            let notified = self.notify.notified();
            if predicate() {
                return;
            }
            notified.await;
        }
    }

    /// Empties both indexes. Used by `Store::shutdown`: in-flight actions
    /// keep running, but nothing can be newly gated or waited on.
    pub fn clear(&self) {
        self.by_type
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.by_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ProbeA;
    struct ProbeB;

    #[test]
    fn fresh_registry_has_nothing_in_flight() {
        let registry = WaitRegistry::new();
        assert!(!registry.is_waiting_type(TypeId::of::<ProbeA>()));
        assert!(!registry.is_any_waiting());
    }

    #[test]
    fn entering_marks_type_waiting_until_ticket_drops() {
        let registry = WaitRegistry::new();
        let ticket = registry.enter(TypeId::of::<ProbeA>());
        assert!(registry.is_waiting_type(TypeId::of::<ProbeA>()));
        assert!(!registry.is_waiting_type(TypeId::of::<ProbeB>()));
        drop(ticket);
        assert!(!registry.is_waiting_type(TypeId::of::<ProbeA>()));
    }

    #[test]
    fn finish_is_equivalent_to_drop() {
        let registry = WaitRegistry::new();
        let ticket = registry.enter(TypeId::of::<ProbeA>());
        ticket.finish();
        assert!(!registry.is_waiting_type(TypeId::of::<ProbeA>()));
    }

    #[test]
    fn try_hold_is_exclusive() {
        let registry = WaitRegistry::new();
        let key = LockKey::by_type::<ProbeA>();
        assert!(registry.try_hold(key.clone()));
        assert!(!registry.try_hold(key.clone()));
        registry.release(&key);
        assert!(registry.try_hold(key));
    }

    #[tokio::test]
    async fn wait_until_unblocks_on_notify() {
        let registry = WaitRegistry::new();
        let ticket = registry.enter(TypeId::of::<ProbeA>());
        let type_id = TypeId::of::<ProbeA>();

        let waited = tokio::time::timeout(std::time::Duration::from_millis(500), async {
            registry.wait_until(|| !registry.is_waiting_type(type_id)).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ticket.finish();

        assert!(waited.await.is_ok());
    }

    #[test]
    fn clear_empties_both_indexes() {
        let registry = WaitRegistry::new();
        let _ticket = registry.enter(TypeId::of::<ProbeA>());
        let key = LockKey::by_type::<ProbeB>();
        assert!(registry.try_hold(key.clone()));
        registry.clear();
        assert!(!registry.is_any_waiting());
        assert!(!registry.is_held(&key));
    }
}
