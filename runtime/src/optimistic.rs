//! Runtime-side execution of the three optimistic mixins.
//!
//! [`flux_core::optimistic`] only declares the capability traits; the
//! actual apply/save/rollback and stable-sync/push algorithms — the
//! hardest state machines in the engine — live here, dispatched through
//! dedicated `Store` methods rather than the generic executor.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Mutex;

use flux_core::action::LockKey;
use flux_core::error::WrappedError;
use flux_core::optimistic::{
    OptimisticSyncAction, OptimisticSyncWithPushAction, OptimisticUpdateAction, ServerPushAction,
    SyncResponse,
};
use flux_core::status::ActionStatus;

use crate::notifier::Notifier;
use crate::retry::{retry_reduce, RetryPolicy};
use crate::state_cell::StateCell;
use crate::wait_registry::WaitRegistry;

/// Per-sync-key bookkeeping for `OptimisticSync`/`OptimisticSyncWithPush`:
/// `{ locked, sentValue, latestIntent }` plus the revision fields the push
/// variant needs.
struct SyncSlot<V> {
    locked: bool,
    sent_value: Option<V>,
    latest_intent: Option<V>,
    local_revision: u64,
    sent_local_revision: u64,
    server_revision: Option<u64>,
}

impl<V> Default for SyncSlot<V> {
    fn default() -> Self {
        Self {
            locked: false,
            sent_value: None,
            latest_intent: None,
            local_revision: 0,
            sent_local_revision: 0,
            server_revision: None,
        }
    }
}

/// Type-erased map of sync-key state, shared by every `OptimisticSync`-family
/// action regardless of its `Value` type.
#[derive(Default)]
pub struct OptimisticSyncRegistry {
    slots: Mutex<HashMap<LockKey, Box<dyn Any + Send + Sync>>>,
}

impl OptimisticSyncRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<V: Send + Sync + 'static, R>(
        &self,
        key: &LockKey,
        f: impl FnOnce(&mut SyncSlot<V>) -> R,
    ) -> R {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = slots
            .entry(key.clone())
            .or_insert_with(|| Box::new(SyncSlot::<V>::default()) as Box<dyn Any + Send + Sync>);
        let slot = entry
            .downcast_mut::<SyncSlot<V>>()
            .expect("sync key reused with a different Value type");
        f(slot)
    }

    fn remove(&self, key: &LockKey) {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    /// Drop all sync-key state. Used by `Store::shutdown`.
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

/// Run one `OptimisticUpdateAction` dispatch: optimistic apply, retried
/// save, conditional rollback, optional reload. The apply and any rollback
/// each happen at most once; retries never re-apply the optimistic value.
///
/// The optimistic apply (read current value, compute the next value, write
/// it) and the conditional rollback are each done under the state cell's
/// write lock for their whole read-compute-write span, so a concurrent
/// dispatch on the same state can't interleave between the read and the
/// write and silently lose one side's update.
///
/// Registers a [`WaitRegistry`] ticket and reports terminal outcome on
/// `status` the same way [`crate::executor::execute`] does, so `isWaiting`
/// and `is_completed*` are meaningful for optimistic dispatches too.
pub async fn run_optimistic_update<A>(
    action: &A,
    env: &A::Environment,
    state_cell: &StateCell<A::State>,
    notifier: &Notifier<A::State>,
    wait_registry: &WaitRegistry,
    status: &ActionStatus,
) -> Result<(), WrappedError>
where
    A: OptimisticUpdateAction,
{
    let action_name = std::any::type_name::<A>();
    status.mark_dispatched();
    let _ticket = wait_registry.enter(TypeId::of::<A>());

    let (before, after, (value, prior)) = state_cell
        .update(|state| {
            let value = action.new_value(state, env);
            let prior = action.get_value_from_state(state);
            let next = action.apply_value_to_state(state, value.clone());
            (next, (value, prior))
        })
        .await;
    if before != after {
        notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
    }

    let save_result = match action.policy().retry {
        Some(retry_mixin) => {
            let policy = RetryPolicy::from(retry_mixin);
            retry_reduce(&policy, |_attempt| action.save_value(value.clone(), env)).await
        }
        None => action.save_value(value.clone(), env).await,
    };

    let result = if let Err(err) = &save_result {
        let (before, after, rolled_back) = state_cell
            .update(|state| {
                if action.get_value_from_state(state) == value {
                    (action.apply_value_to_state(state, prior.clone()), true)
                } else {
                    (state.clone(), false)
                }
            })
            .await;
        if rolled_back && before != after {
            notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
        }
        Err(err.clone())
    } else {
        Ok(())
    };

    if let Some(reload) = action.reload_value(env) {
        if let Ok(reloaded) = reload.await {
            let (before, after, ()) = state_cell
                .update(|state| (action.apply_value_to_state(state, reloaded.clone()), ()))
                .await;
            if before != after {
                notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
            }
        }
    }

    match &result {
        Ok(()) => status.complete(None, None),
        Err(err) => status.complete(Some(err.clone()), Some(err.clone())),
    }
    result
}

/// Run one `OptimisticSyncAction` dispatch: coalesce into the key's stable
/// sync loop if one is already in flight, otherwise become its runner.
///
/// Registers a [`WaitRegistry`] ticket and reports terminal outcome on
/// `status` for the whole of this call, including any time spent coalesced
/// behind another dispatch's drain loop.
pub async fn run_optimistic_sync<A>(
    action: &A,
    env: &A::Environment,
    state_cell: &StateCell<A::State>,
    notifier: &Notifier<A::State>,
    registry: &OptimisticSyncRegistry,
    wait_registry: &WaitRegistry,
    status: &ActionStatus,
) -> Result<(), WrappedError>
where
    A: OptimisticSyncAction,
{
    let action_name = std::any::type_name::<A>();
    status.mark_dispatched();
    let _ticket = wait_registry.enter(TypeId::of::<A>());

    let key = action.sync_key();

    // The optimistic apply and the locked-vs-runner decision are made
    // atomically (both synchronous, under the state cell's write lock) so
    // two concurrent dispatches for the same key can't each read a stale
    // pre-apply value and clobber one another.
    let (before, after, (value, became_runner)) = state_cell
        .update(|state| {
            let value = action.value_to_apply(state, env);
            let next = action.apply_value_to_state(state, value.clone());
            let became_runner = registry.with_slot::<A::Value, _>(&key, |slot| {
                slot.latest_intent = Some(value.clone());
                if slot.locked {
                    false
                } else {
                    slot.locked = true;
                    slot.sent_value = Some(value.clone());
                    true
                }
            });
            (next, (value, became_runner))
        })
        .await;
    if before != after {
        notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
    }

    if !became_runner {
        status.complete(None, None);
        return Ok(());
    }

    let mut sent = value;
    let result = 'drain: loop {
        match action.send_value_to_server(sent.clone(), env).await {
            SyncResponse::Applied(response) => {
                let (before, after, applied) = state_cell
                    .update(|state| {
                        if action.get_value_from_state(state) == sent {
                            (action.apply_server_response_to_state(state, response.clone()), true)
                        } else {
                            (state.clone(), false)
                        }
                    })
                    .await;
                if applied && before != after {
                    notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
                }
            }
            SyncResponse::Failed(err) => {
                action.on_finish(Some(&err), env);
                registry.remove(&key);
                break 'drain Err(err);
            }
        }

        let current_value = action.get_value_from_state(&state_cell.get().await);
        if current_value == sent {
            registry.with_slot::<A::Value, _>(&key, |slot| {
                slot.locked = false;
                slot.sent_value = None;
                slot.latest_intent = None;
            });
            action.on_finish(None, env);
            break 'drain Ok(());
        }

        sent = current_value;
        registry.with_slot::<A::Value, _>(&key, |slot| {
            slot.sent_value = Some(sent.clone());
        });
    };

    match &result {
        Ok(()) => status.complete(None, None),
        Err(err) => status.complete(Some(err.clone()), Some(err.clone())),
    }
    result
}

/// Run one `OptimisticSyncWithPushAction` dispatch: as
/// [`run_optimistic_sync`], but drain decisions and response application
/// are gated on revision arithmetic rather than raw value comparison.
pub async fn run_optimistic_sync_with_push<A>(
    action: &A,
    env: &A::Environment,
    state_cell: &StateCell<A::State>,
    notifier: &Notifier<A::State>,
    registry: &OptimisticSyncRegistry,
    wait_registry: &WaitRegistry,
    status: &ActionStatus,
) -> Result<(), WrappedError>
where
    A: OptimisticSyncWithPushAction,
{
    let action_name = std::any::type_name::<A>();
    status.mark_dispatched();
    let _ticket = wait_registry.enter(TypeId::of::<A>());

    let key = action.sync_key();

    let (before, after, (value, runner_sent_revision)) = state_cell
        .update(|state| {
            let value = action.value_to_apply(state, env);
            let next = action.apply_value_to_state(state, value.clone());
            let runner_sent_revision = registry.with_slot::<A::Value, _>(&key, |slot| {
                slot.local_revision += 1;
                let my_revision = slot.local_revision;
                slot.latest_intent = Some(value.clone());
                if slot.locked {
                    None
                } else {
                    slot.locked = true;
                    slot.sent_value = Some(value.clone());
                    slot.sent_local_revision = my_revision;
                    Some(my_revision)
                }
            });
            (next, (value, runner_sent_revision))
        })
        .await;
    if before != after {
        notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
    }

    let Some(_sent_revision) = runner_sent_revision else {
        status.complete(None, None);
        return Ok(());
    };

    let mut sent = value;
    let result = 'drain: loop {
        let response = action.send_value_to_server(sent.clone(), env).await;
        let response_revision = A::server_revision(&response);

        match response {
            SyncResponse::Applied(payload) => {
                let (before, after, applied) = state_cell
                    .update(|state| {
                        let should_apply = registry.with_slot::<A::Value, _>(&key, |slot| {
                            match response_revision {
                                Some(rev) if slot.server_revision.is_none_or(|current| rev > current) => {
                                    slot.server_revision = Some(rev);
                                    true
                                }
                                Some(_) => false,
                                None => true,
                            }
                        }) && action.get_value_from_state(state) == sent;
                        if should_apply {
                            (action.apply_server_response_to_state(state, payload.clone()), true)
                        } else {
                            (state.clone(), false)
                        }
                    })
                    .await;
                if applied && before != after {
                    notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
                }
            }
            SyncResponse::Failed(err) => {
                action.on_finish(Some(&err), env);
                registry.remove(&key);
                break 'drain Err(err);
            }
        }

        let next = registry.with_slot::<A::Value, _>(&key, |slot| {
            if slot.local_revision > slot.sent_local_revision {
                let intent = slot
                    .latest_intent
                    .clone()
                    .expect("latest_intent set whenever local_revision advances");
                slot.sent_value = Some(intent.clone());
                slot.sent_local_revision = slot.local_revision;
                Some(intent)
            } else {
                slot.locked = false;
                slot.sent_value = None;
                None
            }
        });

        match next {
            Some(follow_up) => sent = follow_up,
            None => {
                action.on_finish(None, env);
                break 'drain Ok(());
            }
        }
    };

    match &result {
        Ok(()) => status.complete(None, None),
        Err(err) => status.complete(Some(err.clone()), Some(err.clone())),
    }
    result
}

/// Apply a `ServerPushAction`: applied immediately, regardless of lock
/// state, iff its revision is newer than the one on record. Never touches
/// `local_revision`.
pub async fn apply_server_push<A>(
    action: &A,
    state_cell: &StateCell<A::State>,
    notifier: &Notifier<A::State>,
    registry: &OptimisticSyncRegistry,
) where
    A: ServerPushAction,
{
    let key = action.sync_key();
    let rev = action.server_rev();

    let (before, after, applied) = state_cell
        .update(|state| {
            let should_apply = registry.with_slot::<A::Value, _>(&key, |slot| {
                if slot.server_revision.is_none_or(|current| rev > current) {
                    slot.server_revision = Some(rev);
                    true
                } else {
                    false
                }
            });
            if should_apply {
                (action.apply_to_state(state, action.value()), true)
            } else {
                (state.clone(), false)
            }
        })
        .await;
    if applied && before != after {
        let action_name = std::any::type_name::<A>();
        notifier.notify_state_change(action_name, state_cell.dispatch_count(), &before, &after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::action::{Action, BoxFuture, LockKey as Key, ReduceOutcome};

    #[derive(Clone, PartialEq, Debug)]
    struct LikeState {
        liked: bool,
        saved_calls: u32,
    }

    struct Env;

    struct ToggleLike {
        fail_save: bool,
        save_delay: std::time::Duration,
    }

    impl ToggleLike {
        fn new(fail_save: bool) -> Self {
            Self { fail_save, save_delay: std::time::Duration::ZERO }
        }
    }

    impl Action for ToggleLike {
        type State = LikeState;
        type Environment = Env;

        fn reduce(&self, _state: &Self::State, _env: &Self::Environment) -> ReduceOutcome<Self::State> {
            ReduceOutcome::NoOp
        }
    }

    impl OptimisticUpdateAction for ToggleLike {
        type Value = bool;

        fn new_value(&self, state: &Self::State, _env: &Self::Environment) -> bool {
            !state.liked
        }

        fn get_value_from_state(&self, state: &Self::State) -> bool {
            state.liked
        }

        fn apply_value_to_state(&self, state: &Self::State, value: bool) -> Self::State {
            LikeState { liked: value, ..state.clone() }
        }

        fn save_value(&self, _value: bool, _env: &Self::Environment) -> BoxFuture<'static, Result<(), WrappedError>> {
            let fail = self.fail_save;
            let delay = self.save_delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    Err(flux_core::error::UserException::new("save failed").into())
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn optimistic_update_applies_and_persists_on_success() {
        let action = ToggleLike::new(false);
        let state_cell = StateCell::new(LikeState { liked: false, saved_calls: 0 });
        let notifier = Notifier::new();
        let wait_registry = WaitRegistry::new();
        let status = ActionStatus::new();

        let result = run_optimistic_update(&action, &Env, &state_cell, &notifier, &wait_registry, &status).await;

        assert!(result.is_ok());
        assert!(state_cell.get().await.liked);
        assert!(status.is_completed_ok());
        assert!(!wait_registry.is_waiting_type(TypeId::of::<ToggleLike>()));
    }

    #[tokio::test]
    async fn optimistic_update_rolls_back_on_failure_when_state_stable() {
        let action = ToggleLike::new(true);
        let state_cell = StateCell::new(LikeState { liked: false, saved_calls: 0 });
        let notifier = Notifier::new();
        let wait_registry = WaitRegistry::new();
        let status = ActionStatus::new();

        let result = run_optimistic_update(&action, &Env, &state_cell, &notifier, &wait_registry, &status).await;

        assert!(result.is_err());
        assert!(!state_cell.get().await.liked);
        assert!(status.is_completed_failed());
        assert!(status.original_error().is_some());
    }

    #[tokio::test]
    async fn optimistic_update_skips_rollback_when_state_drifted() {
        use std::sync::Arc;
        use std::time::Duration;

        // `save_value` sleeps long enough for a concurrent action to change
        // `liked` to a value other than the one this dispatch optimistically
        // applied, before the failed save considers rolling back.
        let action = ToggleLike { fail_save: true, save_delay: Duration::from_millis(40) };
        let state_cell = Arc::new(StateCell::new(LikeState { liked: false, saved_calls: 0 }));
        let notifier = Notifier::new();
        let wait_registry = WaitRegistry::new();
        let status = ActionStatus::new();

        let racer_cell = Arc::clone(&state_cell);
        let racer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            racer_cell.update(|_| (LikeState { liked: false, saved_calls: 7 }, ())).await;
        });

        let result = run_optimistic_update(&action, &Env, &state_cell, &notifier, &wait_registry, &status).await;
        racer.await.unwrap();

        assert!(result.is_err());
        // The drifted write (`saved_calls: 7`, `liked: false` != the
        // dispatch's optimistic `true`) survives untouched: no rollback ran.
        assert_eq!(state_cell.get().await, LikeState { liked: false, saved_calls: 7 });
    }

    #[derive(Clone, PartialEq, Debug)]
    struct Counter(i64);

    struct Bump;

    impl Action for Bump {
        type State = Counter;
        type Environment = Env;
        fn reduce(&self, _state: &Self::State, _env: &Self::Environment) -> ReduceOutcome<Self::State> {
            ReduceOutcome::NoOp
        }
    }

    impl OptimisticSyncAction for Bump {
        type Value = i64;

        fn sync_key(&self) -> Key {
            Key::by_type::<Bump>()
        }

        fn value_to_apply(&self, state: &Self::State, _env: &Self::Environment) -> i64 {
            state.0 + 1
        }

        fn get_value_from_state(&self, state: &Self::State) -> i64 {
            state.0
        }

        fn apply_value_to_state(&self, _state: &Self::State, value: i64) -> Self::State {
            Counter(value)
        }

        fn send_value_to_server(&self, value: i64, _env: &Self::Environment) -> BoxFuture<'static, SyncResponse<i64>> {
            Box::pin(async move { SyncResponse::Applied(value) })
        }

        fn apply_server_response_to_state(&self, _state: &Self::State, response: i64) -> Self::State {
            Counter(response)
        }
    }

    #[tokio::test]
    async fn optimistic_sync_single_dispatch_unlocks_after_drain() {
        let action = Bump;
        let state_cell = StateCell::new(Counter(0));
        let notifier = Notifier::new();
        let registry = OptimisticSyncRegistry::new();
        let wait_registry = WaitRegistry::new();
        let status = ActionStatus::new();

        let result = run_optimistic_sync(&action, &Env, &state_cell, &notifier, &registry, &wait_registry, &status).await;

        assert!(result.is_ok());
        assert_eq!(state_cell.get().await, Counter(1));
        assert!(status.is_completed_ok());
        assert!(!wait_registry.is_waiting_type(TypeId::of::<Bump>()));
    }

    #[tokio::test]
    async fn concurrent_optimistic_sync_coalesces_onto_one_runner() {
        use std::sync::Arc;

        let action = Arc::new(Bump);
        let state_cell = Arc::new(StateCell::new(Counter(0)));
        let notifier = Arc::new(Notifier::new());
        let registry = Arc::new(OptimisticSyncRegistry::new());
        let wait_registry = Arc::new(WaitRegistry::new());
        let first_status = ActionStatus::new();
        let second_status = ActionStatus::new();

        let (a, s, n, r, w) = (
            Arc::clone(&action),
            Arc::clone(&state_cell),
            Arc::clone(&notifier),
            Arc::clone(&registry),
            Arc::clone(&wait_registry),
        );
        let first_status_clone = first_status.clone();
        let first = tokio::spawn(async move {
            run_optimistic_sync(&*a, &Env, &s, &n, &r, &w, &first_status_clone).await
        });
        let second = run_optimistic_sync(&*action, &Env, &state_cell, &notifier, &registry, &wait_registry, &second_status).await;

        let first = first.await.unwrap();
        assert!(first.is_ok());
        assert!(second.is_ok());
        // Both intents were applied optimistically and drained to the server.
        assert_eq!(state_cell.get().await, Counter(2));
        assert!(first_status.is_completed_ok());
        assert!(second_status.is_completed_ok());
    }
}
