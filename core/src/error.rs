//! Error taxonomy for the action pipeline.
//!
//! Three distinct kinds the core raises or carries, per the contract errors /
//! user errors / unknown errors / timeouts taxonomy: [`StoreException`]
//! (contract violations, never wrapped), [`UserException`] (the
//! authored-business-error type), and [`TimeoutException`] (wait primitives
//! only). Anything else a `before`/`reduce` throws is an "unknown error" and
//! is carried as [`WrappedError::Other`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Contract violations: bad return shapes, misuse of wait primitives. Never
/// wrapped by `wrapError` — these always reach the caller verbatim.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreException {
    /// `before` returned something other than `void`/`Future<void>`.
    #[error("Before should return `void` or `Future<void>`. Do not return `FutureOr`.")]
    InvalidBeforeReturn,

    /// `reduce` returned a forbidden shape (nullable future, future-or-value).
    #[error("Reducer should return `St?` or `Future<St?>`. Do not return `Future<St?>?`.")]
    InvalidReduceReturn,

    /// `dispatchSync` was called on an action whose lifecycle contains a future.
    #[error("Can't dispatchSync({0}) the action, because it is async.")]
    DispatchSyncOnAsyncAction(String),

    /// Two mixins declared on the same action are mutually exclusive.
    #[error("The {0} mixin cannot be combined with the {1} mixin.")]
    IncompatibleMixins(&'static str, &'static str),

    /// `waitAllActions([])` was called with no actions in flight and
    /// `completeImmediately = false`.
    #[error("{0}")]
    WaitPrecondition(String),

    /// Any other fixed-message contract violation.
    #[error("{0}")]
    Other(String),
}

/// Raised by wait primitives (`waitCondition`, `waitActionType`, ...) when
/// their deadline elapses before the predicate is satisfied.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("timed out waiting for condition")]
pub struct TimeoutException;

/// The authored-business-error type: carries a chainable reason, an optional
/// hard (non-`UserException`) cause, a property bag, and optional callbacks.
///
/// Cloning a `UserException` is required because the same wrapped error must
/// reach both the action's own future resolution and the global error
/// observer; callbacks are therefore held behind `Arc` so clones remain
/// callable post-throw.
#[derive(Clone)]
pub struct UserException {
    msg: String,
    reason: Option<String>,
    hard_cause: Option<Arc<dyn StdError + Send + Sync>>,
    props: std::collections::BTreeMap<String, String>,
    on_ok: Option<Arc<dyn Fn() + Send + Sync>>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl UserException {
    /// Create a new `UserException` with just a message.
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            reason: None,
            hard_cause: None,
            props: std::collections::BTreeMap::new(),
            on_ok: None,
            on_cancel: None,
        }
    }

    /// Append a reason. Multiple calls concatenate with `"\n\nReason: "`.
    #[must_use]
    pub fn add_cause(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.reason = Some(match self.reason.take() {
            Some(existing) => format!("{existing}\n\nReason: {reason}"),
            None => reason,
        });
        self
    }

    /// Attach a non-`UserException` hard cause.
    #[must_use]
    pub fn with_hard_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.hard_cause = Some(Arc::new(cause));
        self
    }

    /// Set a property. Last writer wins if the key already exists.
    #[must_use]
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Attach an `onOk` callback, invoked by the UI layer if the user
    /// acknowledges the error.
    #[must_use]
    pub fn with_on_ok(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ok = Some(Arc::new(callback));
        self
    }

    /// Attach an `onCancel` callback.
    #[must_use]
    pub fn with_on_cancel(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(callback));
        self
    }

    /// The message this exception was created with.
    #[must_use]
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// The accumulated reason chain, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// The property bag.
    #[must_use]
    pub fn props(&self) -> &std::collections::BTreeMap<String, String> {
        &self.props
    }

    /// `('', msg)` if no reason; `(msg, reason)` otherwise.
    #[must_use]
    pub fn title_and_content(&self) -> (&str, &str) {
        match &self.reason {
            None => ("", self.msg.as_str()),
            Some(reason) => (self.msg.as_str(), reason.as_str()),
        }
    }

    /// Invoke the `onOk` callback, if any is attached.
    pub fn call_on_ok(&self) {
        if let Some(callback) = &self.on_ok {
            callback();
        }
    }

    /// Invoke the `onCancel` callback, if any is attached.
    pub fn call_on_cancel(&self) {
        if let Some(callback) = &self.on_cancel {
            callback();
        }
    }
}

impl fmt::Debug for UserException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserException")
            .field("msg", &self.msg)
            .field("reason", &self.reason)
            .field("props", &self.props)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for UserException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            None => write!(f, "UserException{{{}}}", self.msg),
            Some(reason) => write!(f, "UserException{{{}|Reason: {}}}", self.msg, reason),
        }
    }
}

impl StdError for UserException {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.hard_cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl PartialEq for UserException {
    fn eq(&self, other: &Self) -> bool {
        self.msg == other.msg && self.reason == other.reason && self.props == other.props
    }
}

/// An error that reached a terminal point of the error pipeline (after
/// `originalError` has passed through per-action and global `wrapError`).
///
/// `Clone`-able because the same wrapped error is delivered to the action's
/// own future resolution *and* to the global error observer.
#[derive(Debug, Clone)]
pub enum WrappedError {
    /// A contract violation raised by the core itself.
    Store(StoreException),
    /// An authored business error.
    User(UserException),
    /// Any other throwable, erased behind `Arc` so the wrapper stays `Clone`.
    Other(Arc<dyn StdError + Send + Sync>),
}

impl WrappedError {
    /// Erase an arbitrary error into a [`WrappedError::Other`].
    pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(err))
    }
}

impl fmt::Display for WrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::User(err) => write!(f, "{err}"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for WrappedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::User(err) => Some(err),
            Self::Other(err) => Some(err.as_ref()),
        }
    }
}

impl From<StoreException> for WrappedError {
    fn from(err: StoreException) -> Self {
        Self::Store(err)
    }
}

impl From<UserException> for WrappedError {
    fn from(err: UserException) -> Self {
        Self::User(err)
    }
}
