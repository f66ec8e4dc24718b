//! Capability traits for the three optimistic mixins.
//!
//! `OptimisticUpdate`, `OptimisticSync`, and `OptimisticSyncWithPush` need
//! additional associated methods beyond what the flat [`ActionPolicy`] can
//! carry, so — mirroring the teacher's dedicated `EventStoreOperation`/
//! `EventBusOperation` effect arms — they are modeled as standalone
//! capability traits, dispatched through dedicated `Store` methods rather
//! than through the generic `Action` lifecycle.
//!
//! [`ActionPolicy`]: crate::action::ActionPolicy

use crate::action::{Action, BoxFuture, LockKey};
use crate::error::WrappedError;

/// An action that optimistically applies a locally-known value, persists it,
/// and rolls back on failure if state hasn't drifted.
pub trait OptimisticUpdateAction: Action {
    /// The type of value being optimistically updated (e.g. `bool` for a
    /// "liked" toggle).
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Compute the value this dispatch should apply.
    fn new_value(&self, state: &Self::State, env: &Self::Environment) -> Self::Value;

    /// Read the current value out of state (used to detect drift before
    /// rolling back, and to decide whether a rollback is even needed).
    fn get_value_from_state(&self, state: &Self::State) -> Self::Value;

    /// Produce the state with `value` applied.
    fn apply_value_to_state(&self, state: &Self::State, value: Self::Value) -> Self::State;

    /// Persist the value. Retried by the action's `ActionPolicy::retry` if
    /// set; the optimistic apply itself is never retried.
    fn save_value(
        &self,
        value: Self::Value,
        env: &Self::Environment,
    ) -> BoxFuture<'static, Result<(), WrappedError>>;

    /// Optionally reload the authoritative value after save (success or
    /// failure); applied in a finally block.
    fn reload_value(
        &self,
        _env: &Self::Environment,
    ) -> Option<BoxFuture<'static, Result<Self::Value, WrappedError>>> {
        None
    }
}

/// The server-response outcome an `OptimisticSyncAction` dispatch produces.
pub enum SyncResponse<V> {
    /// The server applied the value; no further action needed from the
    /// client beyond merging the response into state.
    Applied(V),
    /// The server call failed; state is left as the last optimistic apply
    /// (no rollback — see the stable-sync algorithm's no-rollback rule).
    Failed(WrappedError),
}

/// An action that coalesces rapid local intents onto a single in-flight
/// request per sync key ("stable sync").
pub trait OptimisticSyncAction: Action {
    /// The type of value being synced (e.g. `bool` for a "liked" toggle).
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// The sync key: state per key is `{ locked, sent_value, latest_intent }`.
    fn sync_key(&self) -> LockKey {
        LockKey::by_type::<Self>()
    }

    /// The value this dispatch wants to apply.
    fn value_to_apply(&self, state: &Self::State, env: &Self::Environment) -> Self::Value;

    /// Read the current value out of state.
    fn get_value_from_state(&self, state: &Self::State) -> Self::Value;

    /// Produce the state with `value` applied optimistically.
    fn apply_value_to_state(&self, state: &Self::State, value: Self::Value) -> Self::State;

    /// Send the current "sent" value to the server.
    fn send_value_to_server(
        &self,
        value: Self::Value,
        env: &Self::Environment,
    ) -> BoxFuture<'static, SyncResponse<Self::Value>>;

    /// Merge a successful server response into state.
    fn apply_server_response_to_state(&self, state: &Self::State, response: Self::Value) -> Self::State;

    /// Called exactly once after the key becomes stable (drain reaches
    /// unlock) or after an error.
    fn on_finish(&self, _error: Option<&WrappedError>, _env: &Self::Environment) {}
}

/// `OptimisticSyncWithPush` extends [`OptimisticSyncAction`] with revision
/// arithmetic: each request carries a `localRevision`; a response is applied
/// only if its `serverRevision` is strictly greater than the last recorded
/// one for the key.
pub trait OptimisticSyncWithPushAction: OptimisticSyncAction {
    /// The server-assigned revision carried by a sync response.
    fn server_revision(response: &SyncResponse<Self::Value>) -> Option<u64>;
}

/// A server-pushed update for a revisioned sync key, applied regardless of
/// lock state as long as its revision is newer than the one on record.
/// Must never increment `localRevision`.
pub trait ServerPushAction: Action {
    /// The type of value being pushed.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// The sync key this push targets.
    fn sync_key(&self) -> LockKey;

    /// The server revision carried by this push.
    fn server_rev(&self) -> u64;

    /// The pushed value.
    fn value(&self) -> Self::Value;

    /// Merge the pushed value into state.
    fn apply_to_state(&self, state: &Self::State, value: Self::Value) -> Self::State;
}
