//! The `Action` trait: the three-phase lifecycle (`before -> reduce ->
//! after`) plus the declarative mixin policy a dispatched action carries.
//!
//! Rust's type system already forbids the forbidden reducer return shapes
//! ("nullable future", "future-or-value") that the source has to detect
//! dynamically: [`ReduceOutcome`] is the static sum type the design notes
//! call for (`None | Sync(S) | Async(Promise<S | None>)`), so those shapes
//! simply cannot be constructed.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::WrappedError;

/// A boxed, owned, `Send` future — the same shape as the teacher's
/// `Effect::Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>)`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The result of a fallible phase: `Ok` on success, `Err` on throw.
pub type ActionResult<T> = Result<T, WrappedError>;

/// What `before` returned: permitted shapes are *void* or *future-of-void*.
pub enum BeforeOutcome {
    /// `before` ran to completion (or failed) without suspending.
    Sync(ActionResult<()>),
    /// `before` is asynchronous; await it to learn whether it failed.
    Async(BoxFuture<'static, ActionResult<()>>),
}

impl BeforeOutcome {
    /// The default `before`: a synchronous no-op.
    #[must_use]
    pub fn noop() -> Self {
        Self::Sync(Ok(()))
    }
}

/// What `reduce` returned: `None` (no-op), a synchronous next state, or an
/// asynchronous next state (`Option` inside the future covers
/// "future-of-S-or-null"; a bare "future-of-S" is just `Async` that never
/// produces `None`).
pub enum ReduceOutcome<S> {
    /// The reducer declined to change state.
    NoOp,
    /// The reducer produced a new state without suspending.
    Sync(ActionResult<S>),
    /// The reducer is asynchronous. `Ok(None)` is a no-op; `Ok(Some(s))`
    /// replaces state.
    Async(BoxFuture<'static, ActionResult<Option<S>>>),
}

/// What `after` returned. `after` is a finally-block: its own failure never
/// flips the action's terminal status, it is instead rethrown into the
/// ambient error sink (see the runtime crate's executor).
pub enum AfterOutcome {
    /// `after` ran to completion (or failed) without suspending.
    Sync(ActionResult<()>),
    /// `after` is asynchronous.
    Async(BoxFuture<'static, ActionResult<()>>),
}

impl AfterOutcome {
    /// The default `after`: a synchronous no-op.
    #[must_use]
    pub fn noop() -> Self {
        Self::Sync(Ok(()))
    }
}

/// Retry configuration attached to an action's [`ActionPolicy`].
///
/// Defaults match the source: exponential backoff, 3 attempts.
#[derive(Debug, Clone)]
pub struct RetryMixin {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Maximum retry attempts (ignored when `unlimited` is set).
    pub max_retries: u32,
    /// `UnlimitedRetries`: lifts the `max_retries` cap.
    pub unlimited: bool,
}

impl Default for RetryMixin {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_retries: 3,
            unlimited: false,
        }
    }
}

/// `CheckInternet` / `UnlimitedRetryCheckInternet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInternetMixin {
    /// Probe once; fail fast with `UserException("No internet")` if offline.
    Once,
    /// Loop the whole action until the probe passes.
    Unlimited,
}

/// The flat policy struct an action declares in place of the source's
/// dynamic mixin composition (see the design notes' redesign guidance).
///
/// `OptimisticUpdate`/`OptimisticSync`/`OptimisticSyncWithPush` are not
/// representable here: they need additional associated methods and are
/// instead separate capability traits dispatched through their own `Store`
/// methods (see the runtime crate's `optimistic` module).
#[derive(Debug, Clone, Default)]
pub struct ActionPolicy {
    /// `NonReentrant`: abort if an action sharing this lock key is in flight.
    pub non_reentrant: bool,
    /// `Debounce(duration)`.
    pub debounce: Option<Duration>,
    /// `Throttle(duration)`.
    pub throttle: Option<Duration>,
    /// `Retry`/`UnlimitedRetries`, wraps only the `reduce` phase.
    pub retry: Option<RetryMixin>,
    /// `CheckInternet`/`UnlimitedRetryCheckInternet`.
    pub check_internet: Option<CheckInternetMixin>,
}

impl ActionPolicy {
    /// No mixins: `before -> reduce -> after` runs unconditionally.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether this policy declares no gating mixin at all (used to assert
    /// `OptimisticSync`'s exclusivity list).
    #[must_use]
    pub fn is_plain(&self) -> bool {
        !self.non_reentrant
            && self.debounce.is_none()
            && self.throttle.is_none()
            && self.retry.is_none()
    }
}

/// A coalescing/exclusion identity: the lock key used by `NonReentrant`,
/// `Debounce`, `Throttle`, and the optimistic-sync mixins.
///
/// Defaults to `(concrete action type)`; actions that need a finer key
/// (e.g. "one in-flight save per order id") override
/// [`Action::lock_key`].
#[derive(Clone)]
pub struct LockKey {
    type_id: TypeId,
    type_name: &'static str,
    params: Option<String>,
}

impl LockKey {
    /// A lock key scoped to the concrete action type alone.
    #[must_use]
    pub fn by_type<A: Any>() -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
            params: None,
        }
    }

    /// A lock key scoped to the concrete action type plus a parameter
    /// (e.g. an aggregate id), so unrelated instances of the same action
    /// type don't contend for the same key.
    #[must_use]
    pub fn with_params<A: Any>(params: impl Into<String>) -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: std::any::type_name::<A>(),
            params: Some(params.into()),
        }
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.params {
            Some(params) => write!(f, "LockKey({}, {params})", self.type_name),
            None => write!(f, "LockKey({})", self.type_name),
        }
    }
}

impl PartialEq for LockKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.params == other.params
    }
}

impl Eq for LockKey {}

impl std::hash::Hash for LockKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.params.hash(state);
    }
}

/// A unit of intent: `before -> reduce -> after`, bound to a store's
/// `State`/`Environment` types.
///
/// Only [`Action::reduce`] is required; `before`/`after`/`wrap_error`/
/// `policy`/`lock_key` all have spec-faithful defaults (synchronous no-ops,
/// pass-through wrapping, no mixins, type-scoped lock key).
pub trait Action: Send + Sync + 'static {
    /// The state type this action operates on.
    type State: Clone + PartialEq + Send + Sync + 'static;

    /// The environment type with injected dependencies.
    type Environment: Send + Sync + 'static;

    /// Runs before `reduce`. Permitted to fail; permitted to be async.
    fn before(&self, _state: &Self::State, _env: &Self::Environment) -> BeforeOutcome {
        BeforeOutcome::noop()
    }

    /// The reducer: the only method every action must implement.
    fn reduce(&self, state: &Self::State, env: &Self::Environment) -> ReduceOutcome<Self::State>;

    /// Runs exactly once per dispatched action, on every exit path. Its own
    /// failure is reported asynchronously and never flips the action's
    /// terminal status.
    fn after(&self, _state_before: &Self::State, _state_after: &Self::State, _env: &Self::Environment) -> AfterOutcome {
        AfterOutcome::noop()
    }

    /// Per-action error wrapper, tried before the store's global
    /// `wrap_error`. Returning `None` swallows the error.
    fn wrap_error(&self, error: WrappedError, _env: &Self::Environment) -> Option<WrappedError> {
        Some(error)
    }

    /// Declarative concurrency policy for this action.
    fn policy(&self) -> ActionPolicy {
        ActionPolicy::none()
    }

    /// The coalescing/exclusion identity used by `NonReentrant`/`Debounce`/
    /// `Throttle`/optimistic-sync mixins.
    fn lock_key(&self) -> LockKey {
        LockKey::by_type::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;
    struct OtherProbe;

    #[test]
    fn lock_key_by_type_is_stable_and_type_scoped() {
        let a = LockKey::by_type::<Probe>();
        let b = LockKey::by_type::<Probe>();
        let c = LockKey::by_type::<OtherProbe>();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lock_key_with_params_distinguishes_instances() {
        let a = LockKey::with_params::<Probe>("order-1");
        let b = LockKey::with_params::<Probe>("order-2");
        assert_ne!(a, b);
    }

    #[test]
    fn default_policy_is_plain() {
        assert!(ActionPolicy::none().is_plain());
        let mut policy = ActionPolicy::none();
        policy.non_reentrant = true;
        assert!(!policy.is_plain());
    }

    #[test]
    fn retry_mixin_defaults_match_spec() {
        let retry = RetryMixin::default();
        assert_eq!(retry.max_retries, 3);
        assert!((retry.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(!retry.unlimited);
    }
}
