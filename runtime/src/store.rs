//! The Store facade: the single public entry point wiring together the
//! [`ExecutorContext`], the optimistic-mixin algorithms, the property bag,
//! and the global backdoor registry.
//!
//! Every other module in this crate is a building block; `Store` is the only
//! one application code is expected to hold onto directly.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use flux_core::action::{Action, ActionResult, LockKey};
use flux_core::environment::ConnectivityProbe;
use flux_core::error::{StoreException, TimeoutException, WrappedError};
use flux_core::optimistic::{
    OptimisticSyncAction, OptimisticSyncWithPushAction, OptimisticUpdateAction, ServerPushAction,
};
use flux_core::status::ActionStatus;

use crate::executor::{self, ExecutorContext};
use crate::mixins;
use crate::optimistic::{self, OptimisticSyncRegistry};

/// Registered by every `Store::new` call so [`Store::backdoor_static_global`]
/// can hand back the current instance. Keyed by nothing but the caller's
/// chosen `S, E` — a mismatched type parameter simply fails the downcast.
static GLOBAL_STORE: OnceLock<Box<dyn Any + Send + Sync>> = OnceLock::new();

/// The single-store state-management facade. Owns the state cell, the
/// notifier, the wait registry, the mixin gates, the optimistic-sync
/// registry, and a property bag — everything a dispatched action's lifecycle
/// can touch.
pub struct Store<S, E> {
    ctx: ExecutorContext<S>,
    env: E,
    connectivity: Arc<dyn ConnectivityProbe>,
    optimistic: OptimisticSyncRegistry,
    props: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    is_shutdown: std::sync::atomic::AtomicBool,
}

impl<S, E> Store<S, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Construct a store and register it as the process's current
    /// `backdoor_static_global` instance for this `(S, E)` pair.
    #[must_use]
    pub fn new(initial: S, env: E, connectivity: Arc<dyn ConnectivityProbe>) -> Arc<Self> {
        let store = Arc::new(Self {
            ctx: ExecutorContext::new(initial),
            env,
            connectivity,
            optimistic: OptimisticSyncRegistry::new(),
            props: Mutex::new(HashMap::new()),
            is_shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        let _ = GLOBAL_STORE.set(Box::new(Arc::clone(&store)));
        store
    }

    /// The unique currently-provided store for this `(S, E)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreException::Other`] if no store has been constructed
    /// yet, or if the registered store was built with different `S`/`E`
    /// type parameters.
    pub fn backdoor_static_global() -> ActionResult<Arc<Self>> {
        GLOBAL_STORE
            .get()
            .and_then(|boxed| boxed.downcast_ref::<Arc<Self>>())
            .cloned()
            .ok_or_else(|| StoreException::Other("no compatible global store registered".into()).into())
    }

    /// A clone of the current state.
    pub async fn state(&self) -> S {
        self.ctx.state_cell.get().await
    }

    /// The environment this store was constructed with.
    pub fn environment(&self) -> &E {
        &self.env
    }

    /// Register an observer invoked on every state change with the
    /// dispatched action's name, the dispatch count, and the `before`/`after`
    /// states.
    pub fn subscribe_state(
        &self,
        observer: impl Fn(crate::notifier::StateChange<'_>, &S, &S) + Send + Sync + 'static,
    ) -> crate::notifier::ListenerId {
        self.ctx.notifier.subscribe_state(observer)
    }

    /// Register a selector listener; see [`crate::notifier::Notifier::subscribe_selector`].
    pub fn subscribe_selector<T: PartialEq + 'static>(
        &self,
        select: impl Fn(&S) -> T + Send + Sync + 'static,
        on_change: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> crate::notifier::ListenerId {
        self.ctx.notifier.subscribe_selector(select, on_change)
    }

    /// Set the single global error observer.
    pub fn set_error_observer(&self, observer: impl Fn(&WrappedError) + Send + Sync + 'static) {
        self.ctx.notifier.set_error_observer(observer);
    }

    /// Fire-and-forget dispatch: spawns the full `before -> reduce -> after`
    /// lifecycle and returns its [`ActionStatus`] immediately, before the
    /// dispatch necessarily completes. Requires the store be held behind an
    /// `Arc` since the spawned task outlives this call.
    pub fn dispatch<A>(self: &Arc<Self>, action: A) -> ActionStatus
    where
        A: Action<State = S, Environment = E>,
    {
        let status = ActionStatus::new();
        let status_for_task = status.clone();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let _ = executor::execute(
                &action,
                &store.env,
                &store.ctx,
                store.connectivity.as_ref(),
                &status_for_task,
            )
            .await;
        });
        status
    }

    /// Dispatch and wait for `after` to resolve, surfacing the terminal
    /// error (if any) directly rather than only through the status.
    pub async fn dispatch_and_wait<A>(&self, action: A) -> ActionResult<ActionStatus>
    where
        A: Action<State = S, Environment = E>,
    {
        let status = ActionStatus::new();
        let result = executor::execute(&action, &self.env, &self.ctx, self.connectivity.as_ref(), &status).await;
        result.map(|()| status)
    }

    /// Dispatch and wait, rejecting the action if any lifecycle phase
    /// (`before`, `reduce`, `after`) turns out to be asynchronous.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreException::DispatchSyncOnAsyncAction`] if `before`,
    /// `reduce`, or `after` ever returns an `Async` outcome, even one that
    /// resolves immediately.
    pub async fn dispatch_sync<A>(&self, action: A) -> ActionResult<ActionStatus>
    where
        A: Action<State = S, Environment = E>,
    {
        let status = ActionStatus::new();
        let result =
            executor::execute_sync(&action, &self.env, &self.ctx, self.connectivity.as_ref(), &status).await;
        result.map(|()| status)
    }

    /// Dispatch every action in order, each fire-and-forget.
    pub fn dispatch_all<A>(self: &Arc<Self>, actions: Vec<A>) -> Vec<ActionStatus>
    where
        A: Action<State = S, Environment = E>,
    {
        actions.into_iter().map(|action| self.dispatch(action)).collect()
    }

    /// Dispatch every action and wait for all of them to complete. Actions
    /// run concurrently with each other (as `dispatchAndWaitAll` allows),
    /// not interleaved in lockstep.
    pub async fn dispatch_and_wait_all<A>(&self, actions: Vec<A>) -> Vec<ActionResult<ActionStatus>>
    where
        A: Action<State = S, Environment = E>,
    {
        let futures = actions.into_iter().map(|action| self.dispatch_and_wait(action));
        futures::future::join_all(futures).await
    }

    /// Run an `OptimisticUpdateAction`'s apply/save/rollback algorithm.
    /// Returns the dispatch's [`ActionStatus`] so callers can inspect
    /// `is_completed`/`is_completed_ok` the same way an ordinary dispatch
    /// can.
    pub async fn dispatch_optimistic<A>(&self, action: &A) -> ActionResult<ActionStatus>
    where
        A: OptimisticUpdateAction<State = S, Environment = E>,
    {
        let status = ActionStatus::new();
        optimistic::run_optimistic_update(
            action,
            &self.env,
            &self.ctx.state_cell,
            &self.ctx.notifier,
            &self.ctx.wait_registry,
            &status,
        )
        .await
        .map(|()| status)
    }

    /// Run an `OptimisticSyncAction`'s coalescing stable-sync loop.
    ///
    /// # Errors
    ///
    /// Fails fast with [`StoreException::IncompatibleMixins`] if `action`'s
    /// policy declares any plain gating mixin; `OptimisticSync` is mutually
    /// exclusive with all of them.
    pub async fn dispatch_optimistic_sync<A>(&self, action: &A) -> ActionResult<ActionStatus>
    where
        A: OptimisticSyncAction<State = S, Environment = E>,
    {
        mixins::assert_compatible_with_optimistic_sync(&action.policy())?;
        let status = ActionStatus::new();
        optimistic::run_optimistic_sync(
            action,
            &self.env,
            &self.ctx.state_cell,
            &self.ctx.notifier,
            &self.optimistic,
            &self.ctx.wait_registry,
            &status,
        )
        .await
        .map(|()| status)
    }

    /// As [`Self::dispatch_optimistic_sync`], revision-gated.
    pub async fn dispatch_optimistic_sync_with_push<A>(&self, action: &A) -> ActionResult<ActionStatus>
    where
        A: OptimisticSyncWithPushAction<State = S, Environment = E>,
    {
        mixins::assert_compatible_with_optimistic_sync(&action.policy())?;
        let status = ActionStatus::new();
        optimistic::run_optimistic_sync_with_push(
            action,
            &self.env,
            &self.ctx.state_cell,
            &self.ctx.notifier,
            &self.optimistic,
            &self.ctx.wait_registry,
            &status,
        )
        .await
        .map(|()| status)
    }

    /// Apply an unsolicited `ServerPushAction`.
    pub async fn apply_server_push<A>(&self, action: &A)
    where
        A: ServerPushAction<State = S, Environment = E>,
    {
        optimistic::apply_server_push(action, &self.ctx.state_cell, &self.ctx.notifier, &self.optimistic).await;
    }

    /// Instantaneous: whether any dispatch of `A` is currently in flight.
    #[must_use]
    pub fn is_waiting<A: Action<State = S, Environment = E>>(&self) -> bool {
        self.ctx.wait_registry.is_waiting_type(TypeId::of::<A>())
    }

    /// Resolve the first time `predicate(state)` holds (checked immediately,
    /// then again on every subsequent state change), or fail with
    /// [`TimeoutException`] if `timeout` elapses first.
    pub async fn wait_condition(
        &self,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<(), TimeoutException> {
        if predicate(&self.ctx.state_cell.get().await) {
            return Ok(());
        }

        let notify = Arc::new(tokio::sync::Notify::new());
        let notify_for_observer = Arc::clone(&notify);
        let predicate = Arc::new(predicate);
        let predicate_for_observer = Arc::clone(&predicate);
        let id = self.ctx.notifier.subscribe_state(move |_change, _before, after| {
            if predicate_for_observer(after) {
                notify_for_observer.notify_waiters();
            }
        });

        let wait = async {
            loop {
                if predicate(&self.ctx.state_cell.get().await) {
                    return;
                }
                notify.notified().await;
            }
        };

        let result = match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| TimeoutException),
            None => {
                wait.await;
                Ok(())
            }
        };
        self.ctx.notifier.unsubscribe(id);
        result
    }

    /// Resolve when every action in `statuses` has completed. An empty list
    /// means "when no action at all is in progress".
    ///
    /// # Errors
    ///
    /// Fails with [`StoreException::WaitPrecondition`] if the condition is
    /// already satisfied and `complete_immediately` is `false`.
    pub async fn wait_all_actions(
        &self,
        statuses: &[ActionStatus],
        complete_immediately: bool,
    ) -> ActionResult<()> {
        if statuses.is_empty() {
            if self.ctx.wait_registry.is_any_waiting() {
                self.ctx.wait_registry.wait_until(|| !self.ctx.wait_registry.is_any_waiting()).await;
                return Ok(());
            }
            return if complete_immediately {
                Ok(())
            } else {
                Err(StoreException::WaitPrecondition(
                    "waitAllActions([]) called with no actions in flight".into(),
                )
                .into())
            };
        }

        let all_done = || statuses.iter().all(ActionStatus::is_completed);
        if all_done() {
            return if complete_immediately {
                Ok(())
            } else {
                Err(StoreException::WaitPrecondition(
                    "waitAllActions called with every listed action already complete".into(),
                )
                .into())
            };
        }
        self.ctx.wait_registry.wait_until(all_done).await;
        Ok(())
    }

    /// Resolve when no action of type `A` is in progress.
    pub async fn wait_action_type<A: Action<State = S, Environment = E>>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), TimeoutException> {
        let type_id = TypeId::of::<A>();
        let registry = &self.ctx.wait_registry;
        let wait = registry.wait_until(|| !registry.is_waiting_type(type_id));
        match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| TimeoutException),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    /// Resolve when none of `type_ids` is in progress.
    pub async fn wait_all_action_types(
        &self,
        type_ids: &[TypeId],
        timeout: Option<Duration>,
    ) -> Result<(), TimeoutException> {
        let registry = &self.ctx.wait_registry;
        let wait = registry.wait_until(|| type_ids.iter().all(|id| !registry.is_waiting_type(*id)));
        match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| TimeoutException),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    /// Resolve once the snapshot of in-flight action types satisfies
    /// `predicate`.
    pub async fn wait_action_condition(&self, predicate: impl Fn(&[TypeId]) -> bool) {
        let registry = &self.ctx.wait_registry;
        registry.wait_until(|| predicate(&registry.in_flight_types())).await;
    }

    /// Resolve with whichever of `type_ids` is the first to stop being in
    /// flight, or fail with [`TimeoutException`].
    pub async fn wait_any_action_type_finishes(
        &self,
        type_ids: &[TypeId],
        timeout: Option<Duration>,
    ) -> Result<TypeId, TimeoutException> {
        let registry = &self.ctx.wait_registry;
        let initially_waiting: Vec<TypeId> =
            type_ids.iter().copied().filter(|id| registry.is_waiting_type(*id)).collect();
        let candidates = if initially_waiting.is_empty() {
            type_ids.to_vec()
        } else {
            initially_waiting
        };

        let wait = async {
            loop {
                if let Some(finished) = candidates.iter().find(|id| !registry.is_waiting_type(**id)) {
                    return *finished;
                }
                registry.wait_until(|| candidates.iter().any(|id| !registry.is_waiting_type(*id))).await;
            }
        };

        match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| TimeoutException),
            None => Ok(wait.await),
        }
    }

    /// Stash a disposable value under `key`, replacing any previous value.
    pub fn set_prop<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.props
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), Box::new(value));
    }

    /// A clone of the value stored under `key`, if present and of type `T`.
    pub fn get_prop<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.props
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Drop every prop whose key satisfies `predicate` (default: every key).
    pub fn dispose_props(&self, predicate: impl Fn(&str) -> bool) {
        self.props
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|key, _| !predicate(key));
    }

    /// Whether [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Empty the wait registry, mixin-gate timers, optimistic-sync
    /// coalescing state, property bag, and notifier subscriptions.
    /// In-flight actions keep running to completion; they just can no
    /// longer be gated, waited on, or observed after this call.
    pub fn shutdown(&self) {
        self.is_shutdown.store(true, std::sync::atomic::Ordering::Release);
        self.ctx.wait_registry.clear();
        self.ctx.mixin_gates.clear();
        self.optimistic.clear();
        self.ctx.notifier.clear();
        self.props
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
