//! Fan-out of state changes to observers and selector-based listeners, and
//! of terminal errors to the global error observer.
//!
//! All three channels fire synchronously, on the thread that completed the
//! state change — no batching, no microtask hop. A widget rebuilding off a
//! selector sees the exact state the reducer produced, in dispatch order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use flux_core::error::WrappedError;

/// An opaque handle returned by a `subscribe_*` call, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The context a state observer is invoked with: which action produced the
/// transition, the state immediately before and after it, and the store's
/// running dispatch count at the time of the change.
#[derive(Debug, Clone, Copy)]
pub struct StateChange<'a> {
    /// `std::any::type_name` of the dispatched action.
    pub action: &'a str,
    /// The dispatch count (the number of state changes so far, including
    /// this one) at the time this observer fires.
    pub dispatch_count: u64,
}

type StateObserver<S> = Arc<dyn Fn(StateChange<'_>, &S, &S) + Send + Sync>;
type SelectorListener<S> = Arc<dyn Fn(&S, &S) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&WrappedError) + Send + Sync>;

/// The notification substrate a `Store` owns one of.
pub struct Notifier<S> {
    next_id: AtomicU64,
    state_observers: Mutex<Vec<(ListenerId, StateObserver<S>)>>,
    selectors: Mutex<Vec<(ListenerId, SelectorListener<S>)>>,
    error_observer: Mutex<Option<ErrorObserver>>,
}

impl<S> Default for Notifier<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Notifier<S> {
    /// A notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            state_observers: Mutex::new(Vec::new()),
            selectors: Mutex::new(Vec::new()),
            error_observer: Mutex::new(None),
        }
    }

    fn fresh_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an observer invoked on every state change with the
    /// dispatched action's name, the dispatch count, and the `before`/`after`
    /// states, regardless of what changed.
    pub fn subscribe_state(
        &self,
        observer: impl Fn(StateChange<'_>, &S, &S) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.fresh_id();
        self.state_observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Register a selector listener: `select` projects `(old, new)` state
    /// into a comparable value, `on_change` fires only when that projection
    /// actually differs. This is the primitive selector-rebuild widgets are
    /// built on.
    pub fn subscribe_selector<T: PartialEq + 'static>(
        &self,
        select: impl Fn(&S) -> T + Send + Sync + 'static,
        on_change: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.fresh_id();
        let listener: SelectorListener<S> = Arc::new(move |old, new| {
            let before = select(old);
            let after = select(new);
            if before != after {
                on_change(&before, &after);
            }
        });
        self.selectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a state or selector subscription by id. A no-op if the id is
    /// unknown or already removed.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.state_observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
        self.selectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Set the single global error observer, replacing any previous one.
    pub fn set_error_observer(&self, observer: impl Fn(&WrappedError) + Send + Sync + 'static) {
        *self
            .error_observer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Clear the global error observer.
    pub fn clear_error_observer(&self) {
        *self
            .error_observer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Fire every state observer and selector listener for a `old -> new`
    /// transition. Called synchronously right after the state cell swap.
    pub fn notify_state_change(&self, action: &str, dispatch_count: u64, old: &S, new: &S) {
        let observers = self
            .state_observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let change = StateChange { action, dispatch_count };
        for (_, observer) in &observers {
            observer(change, old, new);
        }

        let selectors = self
            .selectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for (_, listener) in &selectors {
            listener(old, new);
        }
    }

    /// Deliver a terminal error to the global observer, if one is set.
    pub fn notify_error(&self, error: &WrappedError) {
        let observer = self
            .error_observer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(error);
        }
    }

    /// Drop every subscriber. Used by `Store::shutdown`.
    pub fn clear(&self) {
        self.state_observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.selectors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.clear_error_observer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn state_observer_sees_every_transition() {
        let notifier: Notifier<i32> = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        notifier.subscribe_state(move |_change, _before, after| seen_clone.lock().unwrap().push(*after));

        notifier.notify_state_change("Increment", 1, &0, &1);
        notifier.notify_state_change("Increment", 2, &1, &2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn state_observer_receives_action_name_and_dispatch_count() {
        let notifier: Notifier<i32> = Notifier::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        notifier.subscribe_state(move |change, before, after| {
            *seen_clone.lock().unwrap() = Some((change.action.to_string(), change.dispatch_count, *before, *after));
        });

        notifier.notify_state_change("Increment", 7, &0, &1);

        assert_eq!(
            *seen.lock().unwrap(),
            Some(("Increment".to_string(), 7, 0, 1))
        );
    }

    #[test]
    fn selector_listener_fires_only_on_projection_change() {
        let notifier: Notifier<(i32, i32)> = Notifier::new();
        let fires = Arc::new(AtomicI32::new(0));
        let fires_clone = Arc::clone(&fires);
        notifier.subscribe_selector(
            |s: &(i32, i32)| s.0,
            move |_before, _after| {
                fires_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Only the second field changes: no fire.
        notifier.notify_state_change("Bump", 1, &(1, 10), &(1, 20));
        assert_eq!(fires.load(Ordering::SeqCst), 0);

        // The selected field changes: fires once.
        notifier.notify_state_change("Bump", 2, &(1, 20), &(2, 20));
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let notifier: Notifier<i32> = Notifier::new();
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = Arc::clone(&count);
        let id = notifier.subscribe_state(move |_change, _before, _after| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify_state_change("Increment", 1, &0, &1);
        notifier.unsubscribe(id);
        notifier.notify_state_change("Increment", 2, &1, &2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_observer_receives_terminal_errors() {
        use flux_core::error::StoreException;

        let notifier: Notifier<i32> = Notifier::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        notifier.set_error_observer(move |err| {
            *seen_clone.lock().unwrap() = Some(err.to_string());
        });

        notifier.notify_error(&WrappedError::Store(StoreException::Other("boom".into())));

        assert_eq!(seen.lock().unwrap().as_deref(), Some("boom"));
    }

    #[test]
    fn clear_drops_all_subscribers() {
        let notifier: Notifier<i32> = Notifier::new();
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = Arc::clone(&count);
        notifier.subscribe_state(move |_change, _before, _after| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        notifier.clear();
        notifier.notify_state_change("Increment", 1, &0, &1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
