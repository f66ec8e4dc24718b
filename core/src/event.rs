//! `Event<T>` — a single-fire value payload embedded in state.
//!
//! Selectors that read an `Event` must treat it as volatile: reading an
//! unspent event consumes it. Because state is immutable, the spent
//! transition is not a mutation of the `Event` in place but the production of
//! a new, already-spent `Event` that the caller swaps back into a freshly
//! cloned state snapshot (see the runtime crate's selector-listener
//! consumption semantics).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A value that should be observed at most once.
///
/// `Event` is `Clone`, and clones of the *same* construction share the spent
/// flag (so consuming a clone marks the original spent too) while a fresh
/// [`Event::new`] always starts unspent — mirroring the source's "consumed
/// on first read" rule without requiring interior-mutable state.
pub struct Event<T> {
    value: Option<T>,
    spent: Arc<AtomicBool>,
}

impl<T> Event<T> {
    /// Wrap a payload in a fresh, unspent event.
    pub fn new(value: T) -> Self {
        Self {
            value: Some(value),
            spent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An already-spent event carrying no payload.
    #[must_use]
    pub fn spent() -> Self {
        Self {
            value: None,
            spent: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether this event has already been consumed.
    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.spent.load(Ordering::Acquire)
    }
}

impl<T: Clone> Event<T> {
    /// Consume the event: the first call returns the payload, every
    /// subsequent call (on this value or any clone sharing its spent flag)
    /// returns `None`.
    pub fn consume(&self) -> Option<T> {
        if self.spent.swap(true, Ordering::AcqRel) {
            None
        } else {
            self.value.clone()
        }
    }
}

impl<T: Clone> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            spent: Arc::clone(&self.spent),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("spent", &self.is_spent())
            .field("value", &self.value)
            .finish()
    }
}

impl<T: PartialEq> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.is_spent() == other.is_spent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_is_unspent() {
        let event = Event::new(42);
        assert!(!event.is_spent());
    }

    #[test]
    fn consume_returns_payload_once() {
        let event = Event::new("hello");
        assert_eq!(event.consume(), Some("hello"));
        assert!(event.is_spent());
        assert_eq!(event.consume(), None);
    }

    #[test]
    fn clone_shares_spent_flag() {
        let event = Event::new(1);
        let clone = event.clone();
        assert_eq!(event.consume(), Some(1));
        assert!(clone.is_spent());
        assert_eq!(clone.consume(), None);
    }

    #[test]
    fn spent_constructor_has_no_payload() {
        let event: Event<i32> = Event::spent();
        assert!(event.is_spent());
        assert_eq!(event.consume(), None);
    }
}
