//! The state cell: the single `RwLock`-guarded state value plus the
//! monotonic dispatch counter every `Store` owns one of.

use tokio::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Holds the current state value behind a reader-writer lock, readable
/// concurrently by many selectors while a dispatch is in flight.
pub struct StateCell<S> {
    inner: RwLock<S>,
    dispatch_count: AtomicU64,
}

impl<S: Clone> StateCell<S> {
    /// Seed the cell with the store's initial state.
    pub fn new(initial: S) -> Self {
        Self {
            inner: RwLock::new(initial),
            dispatch_count: AtomicU64::new(0),
        }
    }

    /// A clone of the current state.
    pub async fn get(&self) -> S {
        self.inner.read().await.clone()
    }

    /// Replace the state, returning the value it held before. Bumps the
    /// dispatch counter.
    pub async fn swap(&self, new: S) -> S {
        let mut guard = self.inner.write().await;
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        std::mem::replace(&mut *guard, new)
    }

    /// Replace the state only if `new != old` (by value), to honor the
    /// "identity/equality-by-value is the sole change signal" rule: a
    /// reducer returning an equal state is not a notified transition.
    pub async fn swap_if_changed(&self, new: S) -> Option<S>
    where
        S: PartialEq,
    {
        let mut guard = self.inner.write().await;
        if *guard == new {
            None
        } else {
            self.dispatch_count.fetch_add(1, Ordering::Relaxed);
            Some(std::mem::replace(&mut *guard, new))
        }
    }

    /// The number of times state has actually changed.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    /// Atomically read-compute-write: `f` sees the current state and
    /// produces the replacement plus an arbitrary result, with the write
    /// lock held for the whole of `f`. Used wherever a read used to compute
    /// a write must not race another writer between the two (the optimistic
    /// mixins' "apply based on current state" step).
    pub async fn update<R>(&self, f: impl FnOnce(&S) -> (S, R)) -> (S, S, R) {
        let mut guard = self.inner.write().await;
        let (new, result) = f(&guard);
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        let old = std::mem::replace(&mut *guard, new.clone());
        (old, new, result)
    }
}
