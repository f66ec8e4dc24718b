//! Action status machine.
//!
//! [`ActionStatus`] tracks the lifecycle flags of a single dispatched action
//! as described by the status machine: all flags start `false`/`None` and
//! transition forward-only, becoming terminal once `is_completed` is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::WrappedError;

/// Observable progress of one dispatched action.
///
/// Every flag transitions monotonically `false -> true`. Cloning an
/// `ActionStatus` shares the same underlying flags (they are read by
/// observers and wait primitives concurrently with the executor advancing
/// them), matching the spec's notion of a single status value threaded
/// through `before`/`reduce`/`after`.
#[derive(Debug, Clone)]
pub struct ActionStatus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    is_dispatched: AtomicBool,
    has_finished_before: AtomicBool,
    has_finished_reduce: AtomicBool,
    has_finished_after: AtomicBool,
    is_completed: AtomicBool,
    is_completed_ok: AtomicBool,
    is_completed_failed: AtomicBool,
    original_error: std::sync::Mutex<Option<WrappedError>>,
    error: std::sync::Mutex<Option<WrappedError>>,
}

impl Default for ActionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionStatus {
    /// Create a fresh status with every flag unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                is_dispatched: AtomicBool::new(false),
                has_finished_before: AtomicBool::new(false),
                has_finished_reduce: AtomicBool::new(false),
                has_finished_after: AtomicBool::new(false),
                is_completed: AtomicBool::new(false),
                is_completed_ok: AtomicBool::new(false),
                is_completed_failed: AtomicBool::new(false),
                original_error: std::sync::Mutex::new(None),
                error: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Set at the moment the Facade accepts the action.
    pub fn mark_dispatched(&self) {
        self.inner.is_dispatched.store(true, Ordering::Release);
    }

    /// Set iff `before` returned without throwing.
    pub fn mark_before_finished(&self) {
        self.inner.has_finished_before.store(true, Ordering::Release);
    }

    /// Set iff `reduce` returned a value (null permitted) without throwing.
    pub fn mark_reduce_finished(&self) {
        self.inner.has_finished_reduce.store(true, Ordering::Release);
    }

    /// Set unconditionally after `after` resolves, even if `after` threw.
    pub fn mark_after_finished(&self) {
        self.inner.has_finished_after.store(true, Ordering::Release);
    }

    /// Record the terminal outcome. `wrapped` is `None` for a success.
    /// `original` is the error as `before`/`reduce` raised it, before any
    /// `wrap_error` ran; pass `None` together with `wrapped: None` for a
    /// success, and the pre-wrap error together with `wrapped` on failure.
    pub fn complete(&self, original: Option<WrappedError>, wrapped: Option<WrappedError>) {
        let failed = wrapped.is_some();
        *self
            .inner
            .original_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = original;
        *self
            .inner
            .error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = wrapped;
        self.inner
            .is_completed_failed
            .store(failed, Ordering::Release);
        self.inner
            .is_completed_ok
            .store(!failed, Ordering::Release);
        self.inner.is_completed.store(true, Ordering::Release);
    }

    /// Whether the Facade has accepted the action.
    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.inner.is_dispatched.load(Ordering::Acquire)
    }

    /// Whether `before` returned without throwing.
    #[must_use]
    pub fn has_finished_method_before(&self) -> bool {
        self.inner.has_finished_before.load(Ordering::Acquire)
    }

    /// Whether `reduce` returned without throwing.
    #[must_use]
    pub fn has_finished_method_reduce(&self) -> bool {
        self.inner.has_finished_reduce.load(Ordering::Acquire)
    }

    /// Whether `after` has resolved (always true once the action is done).
    #[must_use]
    pub fn has_finished_method_after(&self) -> bool {
        self.inner.has_finished_after.load(Ordering::Acquire)
    }

    /// Whether the action has reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed.load(Ordering::Acquire)
    }

    /// Whether the action completed successfully. Only meaningful once
    /// [`Self::is_completed`] is `true`.
    #[must_use]
    pub fn is_completed_ok(&self) -> bool {
        self.inner.is_completed_ok.load(Ordering::Acquire)
    }

    /// Whether `before` or `reduce` threw. Only meaningful once
    /// [`Self::is_completed`] is `true`.
    #[must_use]
    pub fn is_completed_failed(&self) -> bool {
        self.inner.is_completed_failed.load(Ordering::Acquire)
    }

    /// The wrapped error for a failed action, if any.
    #[must_use]
    pub fn wrapped_error(&self) -> Option<WrappedError> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The error as `before`/`reduce` raised it, before any `wrap_error` ran.
    /// Independent from [`Self::wrapped_error`] so both ends of the wrap
    /// pipeline are assertable.
    #[must_use]
    pub fn original_error(&self) -> Option<WrappedError> {
        self.inner
            .original_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UserException;

    #[test]
    fn fresh_status_has_every_flag_unset() {
        let status = ActionStatus::new();
        assert!(!status.is_dispatched());
        assert!(!status.has_finished_method_before());
        assert!(!status.has_finished_method_reduce());
        assert!(!status.has_finished_method_after());
        assert!(!status.is_completed());
        assert!(!status.is_completed_ok());
        assert!(!status.is_completed_failed());
        assert!(status.wrapped_error().is_none());
    }

    #[test]
    fn complete_without_error_marks_ok() {
        let status = ActionStatus::new();
        status.mark_dispatched();
        status.mark_before_finished();
        status.mark_reduce_finished();
        status.mark_after_finished();
        status.complete(None, None);

        assert!(status.is_completed());
        assert!(status.is_completed_ok());
        assert!(!status.is_completed_failed());
        assert!(status.original_error().is_none());
    }

    #[test]
    fn complete_with_error_marks_failed_and_keeps_after_finished() {
        let status = ActionStatus::new();
        status.mark_dispatched();
        status.mark_after_finished();
        let original = WrappedError::User(UserException::new("During before"));
        let wrapped = WrappedError::User(UserException::new("During before").add_cause("wrapped"));
        status.complete(Some(original), Some(wrapped));

        assert!(status.is_completed());
        assert!(!status.is_completed_ok());
        assert!(status.is_completed_failed());
        assert!(status.has_finished_method_after());
        assert!(!status.has_finished_method_reduce());
        assert!(status.wrapped_error().is_some());
        assert_ne!(
            status.original_error().unwrap().to_string(),
            status.wrapped_error().unwrap().to_string()
        );
    }

    #[test]
    fn clone_shares_the_same_flags() {
        let status = ActionStatus::new();
        let clone = status.clone();
        status.mark_dispatched();
        assert!(clone.is_dispatched());
    }
}
