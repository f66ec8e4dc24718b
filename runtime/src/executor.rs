//! The Action Executor: orchestrates one dispatch's `before -> reduce ->
//! after`, applies the gating mixins in their fixed order, and reports
//! [`ActionStatus`] transitions along the way.
//!
//! This is the heart of the engine — everything else (the `Store` facade,
//! the optimistic algorithms) is either a thin wrapper around this, or a
//! parallel pipeline that reuses its building blocks ([`StateCell`],
//! [`Notifier`], [`WaitRegistry`]).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flux_core::action::{Action, ActionResult, AfterOutcome, BeforeOutcome, LockKey, ReduceOutcome};
use flux_core::environment::ConnectivityProbe;
use flux_core::error::{StoreException, WrappedError};
use flux_core::status::ActionStatus;

use crate::mixins::{self, GateOutcome, MixinGates, NonReentrantGuard};
use crate::notifier::Notifier;
use crate::retry::{retry_reduce, RetryPolicy};
use crate::state_cell::StateCell;
use crate::wait_registry::WaitRegistry;

/// The shared executor context a `Store` owns one of, threaded through every
/// dispatch.
pub struct ExecutorContext<S> {
    pub state_cell: StateCell<S>,
    pub notifier: Notifier<S>,
    pub wait_registry: Arc<WaitRegistry>,
    pub mixin_gates: MixinGates,
}

impl<S: Clone> ExecutorContext<S> {
    /// A fresh context seeded with `initial` state.
    #[must_use]
    pub fn new(initial: S) -> Self {
        Self {
            state_cell: StateCell::new(initial),
            notifier: Notifier::new(),
            wait_registry: Arc::new(WaitRegistry::new()),
            mixin_gates: MixinGates::new(),
        }
    }
}

/// Run one dispatch of `action` to completion: mixin pre-gate, `before`,
/// `reduce` (retried per policy), state application, `after`, and status
/// reporting. Returns the terminal result after error wrapping.
///
/// `connectivity` is only consulted if the action's policy declares
/// `check_internet`; pass any implementor when the action never uses it.
pub async fn execute<A: Action>(
    action: &A,
    env: &A::Environment,
    ctx: &ExecutorContext<A::State>,
    connectivity: &dyn ConnectivityProbe,
    status: &ActionStatus,
) -> ActionResult<()> {
    let action_name = std::any::type_name::<A>();
    status.mark_dispatched();
    crate::metrics::ActionMetrics::record_dispatched(action_name);
    let started_at = tokio::time::Instant::now();
    let _ticket = ctx.wait_registry.enter(std::any::TypeId::of::<A>());
    let span = tracing::debug_span!("action", action = action_name);
    let _entered = span.enter();

    let policy = action.policy();
    let key = action.lock_key();
    let state_before = ctx.state_cell.get().await;

    // The NonReentrant guard (if any) is held for the rest of this function
    // — through `reduce` and `after` — and only released at the very end
    // (the post-gate, step 9), so it excludes truly concurrent dispatches
    // rather than just the instant of the pre-gate check.
    let (_non_reentrant_guard, result) = match run_pre_gate(&policy, &key, ctx, connectivity).await {
        Err(err) => (None, Err(err)),
        Ok(GateDecision::Abort) => {
            crate::metrics::MixinMetrics::record_gated(action_name);
            (None, Ok(()))
        }
        Ok(GateDecision::Proceed { guard }) => {
            let saw_async = AtomicBool::new(false);
            let result =
                run_lifecycle(action, env, ctx, &policy, status, &state_before, action_name, &saw_async).await;
            (guard, result)
        }
    };

    run_after(action, env, ctx, status, &state_before, &AtomicBool::new(false)).await;

    let final_result = match result {
        Ok(()) => {
            status.complete(None, None);
            Ok(())
        }
        Err(err) => {
            // The global error observer always receives the pre-wrapping
            // error, not whatever `wrap_error` turns it into.
            ctx.notifier.notify_error(&err);
            let wrapped = wrap_error(action, env, err.clone());
            status.complete(Some(err), Some(wrapped.clone()));
            Err(wrapped)
        }
    };

    crate::metrics::ActionMetrics::record_completed(
        action_name,
        started_at.elapsed(),
        final_result.is_err(),
    );
    final_result
}

/// As [`execute`], but fails with [`StoreException::DispatchSyncOnAsyncAction`]
/// the moment any lifecycle phase (`before`, `reduce`, `after`) reports an
/// `Async` outcome, rather than awaiting it to completion. Used by
/// `Store::dispatch_sync`.
pub async fn execute_sync<A: Action>(
    action: &A,
    env: &A::Environment,
    ctx: &ExecutorContext<A::State>,
    connectivity: &dyn ConnectivityProbe,
    status: &ActionStatus,
) -> ActionResult<()> {
    let action_name = std::any::type_name::<A>();
    status.mark_dispatched();
    crate::metrics::ActionMetrics::record_dispatched(action_name);
    let started_at = tokio::time::Instant::now();
    let _ticket = ctx.wait_registry.enter(std::any::TypeId::of::<A>());
    let span = tracing::debug_span!("action", action = action_name, sync_dispatch = true);
    let _entered = span.enter();

    let policy = action.policy();
    let key = action.lock_key();
    let state_before = ctx.state_cell.get().await;
    let saw_async = AtomicBool::new(false);

    let (_non_reentrant_guard, result) = match run_pre_gate(&policy, &key, ctx, connectivity).await {
        Err(err) => (None, Err(err)),
        Ok(GateDecision::Abort) => {
            crate::metrics::MixinMetrics::record_gated(action_name);
            (None, Ok(()))
        }
        Ok(GateDecision::Proceed { guard }) => {
            let result =
                run_lifecycle(action, env, ctx, &policy, status, &state_before, action_name, &saw_async).await;
            (guard, result)
        }
    };

    run_after(action, env, ctx, status, &state_before, &saw_async).await;

    let result = result.and_then(|()| assert_sync::<A>(saw_async.load(Ordering::Relaxed)));

    let final_result = match result {
        Ok(()) => {
            status.complete(None, None);
            Ok(())
        }
        Err(err) => {
            ctx.notifier.notify_error(&err);
            let wrapped = wrap_error(action, env, err.clone());
            status.complete(Some(err), Some(wrapped.clone()));
            Err(wrapped)
        }
    };

    crate::metrics::ActionMetrics::record_completed(
        action_name,
        started_at.elapsed(),
        final_result.is_err(),
    );
    final_result
}

/// The pre-gate's verdict. `Proceed` carries the `NonReentrant` guard (if
/// any), which the caller must hold until the post-gate (the end of
/// [`execute`]) rather than drop immediately.
enum GateDecision {
    Abort,
    Proceed { guard: Option<NonReentrantGuard> },
}

async fn run_pre_gate<A: Action>(
    policy: &flux_core::action::ActionPolicy,
    key: &LockKey,
    ctx: &ExecutorContext<A::State>,
    connectivity: &dyn ConnectivityProbe,
) -> ActionResult<GateDecision> {
    if let Some(mode) = policy.check_internet {
        mixins::check_internet_gate(connectivity, mode).await?;
    }

    let guard = if policy.non_reentrant {
        match mixins::try_enter_non_reentrant(Arc::clone(&ctx.wait_registry), key.clone()) {
            Some(guard) => Some(guard),
            None => return Ok(GateDecision::Abort),
        }
    } else {
        None
    };

    if let Some(duration) = policy.debounce {
        if ctx.mixin_gates.debounce_gate(key, duration).await == GateOutcome::Abort {
            return Ok(GateDecision::Abort);
        }
    }

    if let Some(duration) = policy.throttle {
        if ctx.mixin_gates.throttle_gate(key, duration) == GateOutcome::Abort {
            return Ok(GateDecision::Abort);
        }
    }

    Ok(GateDecision::Proceed { guard })
}

async fn run_lifecycle<A: Action>(
    action: &A,
    env: &A::Environment,
    ctx: &ExecutorContext<A::State>,
    policy: &flux_core::action::ActionPolicy,
    status: &ActionStatus,
    initial_state: &A::State,
    action_name: &str,
    saw_async: &AtomicBool,
) -> ActionResult<()> {
    let before_outcome = action.before(initial_state, env);
    let before_result = match before_outcome {
        BeforeOutcome::Sync(result) => result,
        BeforeOutcome::Async(fut) => {
            saw_async.store(true, Ordering::Relaxed);
            fut.await
        }
    };
    before_result?;
    status.mark_before_finished();

    let reduced = run_reduce(action, env, initial_state, policy, saw_async).await?;
    status.mark_reduce_finished();

    if let Some(new_state) = reduced {
        if let Some(old) = ctx.state_cell.swap_if_changed(new_state).await {
            let after_state = ctx.state_cell.get().await;
            let dispatch_count = ctx.state_cell.dispatch_count();
            ctx.notifier.notify_state_change(action_name, dispatch_count, &old, &after_state);
        }
    }

    Ok(())
}

async fn run_reduce<A: Action>(
    action: &A,
    env: &A::Environment,
    state: &A::State,
    policy: &flux_core::action::ActionPolicy,
    saw_async: &AtomicBool,
) -> ActionResult<Option<A::State>> {
    match policy.retry.clone() {
        Some(retry_mixin) => {
            let retry_policy = RetryPolicy::from(retry_mixin);
            retry_reduce(&retry_policy, |_attempt| resolve_reduce_once(action, state, env, saw_async)).await
        }
        None => resolve_reduce_once(action, state, env, saw_async).await,
    }
}

async fn resolve_reduce_once<A: Action>(
    action: &A,
    state: &A::State,
    env: &A::Environment,
    saw_async: &AtomicBool,
) -> ActionResult<Option<A::State>> {
    match action.reduce(state, env) {
        ReduceOutcome::NoOp => Ok(None),
        ReduceOutcome::Sync(result) => result.map(Some),
        ReduceOutcome::Async(mut fut) => {
            saw_async.store(true, Ordering::Relaxed);
            // Completed-future coercion: poll the reducer's future once by
            // hand. If it is already resolved, force one scheduling
            // round-trip before applying its value, so a dispatch racing in
            // right now can't be silently overwritten by treating this apply
            // as if it had happened synchronously with `return`. If it is
            // still pending, keep polling the same future to completion —
            // this one manual poll changes nothing about when it resolves.
            let waker = futures::task::noop_waker();
            let mut cx = std::task::Context::from_waker(&waker);
            match fut.as_mut().poll(&mut cx) {
                std::task::Poll::Ready(value) => {
                    tokio::task::yield_now().await;
                    value
                }
                std::task::Poll::Pending => fut.await,
            }
        }
    }
}

async fn run_after<A: Action>(
    action: &A,
    env: &A::Environment,
    ctx: &ExecutorContext<A::State>,
    status: &ActionStatus,
    state_before: &A::State,
    saw_async: &AtomicBool,
) {
    let state_after = ctx.state_cell.get().await;
    let outcome = action.after(state_before, &state_after, env);
    let after_result = match outcome {
        AfterOutcome::Sync(result) => result,
        AfterOutcome::Async(fut) => {
            saw_async.store(true, Ordering::Relaxed);
            fut.await
        }
    };
    status.mark_after_finished();

    if let Err(err) = after_result {
        // `after`'s own failure never flips the action's terminal status
        // (the lifecycle result, not this one, decides `isCompletedOk`); it
        // is rethrown into the ambient error sink unconditionally instead.
        tracing::error!(error = %err, "after-phase threw, rethrowing into error sink");
        crate::metrics::counter!("flux.after.rethrown", "action" => std::any::type_name::<A>()).increment(1);
        ctx.notifier.notify_error(&err);
    }
}

fn wrap_error<A: Action>(action: &A, env: &A::Environment, error: WrappedError) -> WrappedError {
    if matches!(error, WrappedError::Store(_)) {
        return error;
    }
    action.wrap_error(error.clone(), env).unwrap_or(error)
}

/// Fail a `dispatch_sync` call on an action whose lifecycle contains any
/// future. Used by the Store facade before invoking [`execute`] at all.
pub fn assert_sync<A: Action>(is_async: bool) -> ActionResult<()> {
    if is_async {
        Err(StoreException::DispatchSyncOnAsyncAction(std::any::type_name::<A>().to_string()).into())
    } else {
        Ok(())
    }
}
