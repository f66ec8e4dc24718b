//! Pre-dispatch gates for the declarative [`ActionPolicy`] mixins:
//! `NonReentrant`, `Debounce`, `Throttle`, and `CheckInternet`. `Retry` lives
//! in [`crate::retry`] since it wraps `reduce` itself rather than gating
//! dispatch.
//!
//! The executor applies these in the fixed order `CheckInternet ->
//! NonReentrant -> Debounce -> Throttle -> reduce(+Retry)`. A gate that
//! decides the dispatch should not run returns [`GateOutcome::Abort`]; the
//! executor then completes the action immediately with no state change and
//! no error, exactly as if it had never been gated into running at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use flux_core::action::{CheckInternetMixin, LockKey};
use flux_core::environment::ConnectivityProbe;
use flux_core::error::{StoreException, WrappedError, UserException};
use tokio::time::Instant;

use crate::wait_registry::WaitRegistry;

/// Whether a gated dispatch should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Run the dispatch.
    Proceed,
    /// Skip the dispatch entirely; it completes with no state change.
    Abort,
}

/// A held [`NonReentrant`] lock key, released (unblocking the next
/// contender) when dropped.
///
/// [`NonReentrant`]: flux_core::action::ActionPolicy::non_reentrant
pub struct NonReentrantGuard {
    registry: Arc<WaitRegistry>,
    key: LockKey,
}

impl Drop for NonReentrantGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Attempt to claim `key` for the duration of one dispatch. `None` means
/// another dispatch already holds it: the caller should `Abort`.
#[must_use]
pub fn try_enter_non_reentrant(registry: Arc<WaitRegistry>, key: LockKey) -> Option<NonReentrantGuard> {
    if registry.try_hold(key.clone()) {
        Some(NonReentrantGuard { registry, key })
    } else {
        None
    }
}

/// Per-lock-key debounce/throttle timer state. Owned by the `Store`
/// alongside the [`WaitRegistry`].
pub struct MixinGates {
    debounce_generation: Mutex<HashMap<LockKey, u64>>,
    throttle_last_run: Mutex<HashMap<LockKey, Instant>>,
}

impl Default for MixinGates {
    fn default() -> Self {
        Self::new()
    }
}

impl MixinGates {
    /// Fresh gate state: nothing debounced or throttled yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            debounce_generation: Mutex::new(HashMap::new()),
            throttle_last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Trailing-edge debounce: sleeps `duration`, then proceeds only if no
    /// newer call for the same `key` arrived while sleeping.
    pub async fn debounce_gate(&self, key: &LockKey, duration: Duration) -> GateOutcome {
        let my_generation = {
            let mut generations = self
                .debounce_generation
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let generation = generations.entry(key.clone()).or_insert(0);
            *generation += 1;
            *generation
        };

        tokio::time::sleep(duration).await;

        let current_generation = *self
            .debounce_generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .unwrap_or(&0);

        if current_generation == my_generation {
            GateOutcome::Proceed
        } else {
            GateOutcome::Abort
        }
    }

    /// Leading-edge throttle: proceeds immediately unless another dispatch
    /// for the same `key` already ran within `duration`.
    pub fn throttle_gate(&self, key: &LockKey, duration: Duration) -> GateOutcome {
        let mut last_run = self
            .throttle_last_run
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        match last_run.get(key) {
            Some(&last) if now.duration_since(last) < duration => GateOutcome::Abort,
            _ => {
                last_run.insert(key.clone(), now);
                GateOutcome::Proceed
            }
        }
    }

    /// Discard all debounce/throttle timer state. Used by `Store::shutdown`.
    pub fn clear(&self) {
        self.debounce_generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.throttle_last_run
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

/// `CheckInternet`/`UnlimitedRetryCheckInternet`: probe connectivity before
/// letting the dispatch through.
///
/// # Errors
///
/// `CheckInternetMixin::Once` returns `UserException("No internet")`
/// (wrapped) the first time the probe reports offline.
/// `CheckInternetMixin::Unlimited` never errors: it polls until the probe
/// reports online.
pub async fn check_internet_gate(
    probe: &dyn ConnectivityProbe,
    mode: CheckInternetMixin,
) -> Result<(), WrappedError> {
    match mode {
        CheckInternetMixin::Once => {
            if probe.is_online().await {
                Ok(())
            } else {
                Err(UserException::new("No internet").into())
            }
        }
        CheckInternetMixin::Unlimited => {
            let mut delay = Duration::from_millis(500);
            while !probe.is_online().await {
                tracing::warn!(delay_ms = delay.as_millis(), "no internet, retrying probe");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Ok(())
        }
    }
}

/// The fixed exclusivity rule for `OptimisticSync`: it cannot be combined
/// with any plain gating mixin.
///
/// # Errors
///
/// Returns [`StoreException::IncompatibleMixins`] naming the offending
/// mixin if `policy` declares anything beyond the default.
pub fn assert_compatible_with_optimistic_sync(
    policy: &flux_core::action::ActionPolicy,
) -> Result<(), StoreException> {
    if policy.non_reentrant {
        return Err(StoreException::IncompatibleMixins("OptimisticSync", "NonReentrant"));
    }
    if policy.debounce.is_some() {
        return Err(StoreException::IncompatibleMixins("OptimisticSync", "Debounce"));
    }
    if policy.throttle.is_some() {
        return Err(StoreException::IncompatibleMixins("OptimisticSync", "Throttle"));
    }
    if policy.retry.is_some() {
        return Err(StoreException::IncompatibleMixins("OptimisticSync", "Retry"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[test]
    fn non_reentrant_is_exclusive_and_released_on_drop() {
        let registry = Arc::new(WaitRegistry::new());
        let key = LockKey::by_type::<Probe>();

        let first = try_enter_non_reentrant(Arc::clone(&registry), key.clone());
        assert!(first.is_some());

        let second = try_enter_non_reentrant(Arc::clone(&registry), key.clone());
        assert!(second.is_none());

        drop(first);
        let third = try_enter_non_reentrant(registry, key);
        assert!(third.is_some());
    }

    #[test]
    fn throttle_gate_admits_first_then_rejects_within_window() {
        let gates = MixinGates::new();
        let key = LockKey::by_type::<Probe>();
        assert_eq!(gates.throttle_gate(&key, Duration::from_secs(10)), GateOutcome::Proceed);
        assert_eq!(gates.throttle_gate(&key, Duration::from_secs(10)), GateOutcome::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_gate_aborts_superseded_calls() {
        let gates = Arc::new(MixinGates::new());
        let key = LockKey::by_type::<Probe>();

        let gates_clone = Arc::clone(&gates);
        let key_clone = key.clone();
        let first = tokio::spawn(async move {
            gates_clone.debounce_gate(&key_clone, Duration::from_millis(100)).await
        });

        tokio::time::advance(Duration::from_millis(10)).await;
        // A second call supersedes the first before it fires.
        let second_outcome = gates.debounce_gate(&key, Duration::from_millis(100)).await;

        let first_outcome = first.await.unwrap();
        assert_eq!(first_outcome, GateOutcome::Abort);
        assert_eq!(second_outcome, GateOutcome::Proceed);
    }

    struct OkProbe;
    impl ConnectivityProbe for OkProbe {
        fn is_online(&self) -> flux_core::action::BoxFuture<'static, bool> {
            Box::pin(async { true })
        }
    }

    struct OfflineProbe;
    impl ConnectivityProbe for OfflineProbe {
        fn is_online(&self) -> flux_core::action::BoxFuture<'static, bool> {
            Box::pin(async { false })
        }
    }

    #[tokio::test]
    async fn check_internet_once_passes_when_online() {
        let result = check_internet_gate(&OkProbe, CheckInternetMixin::Once).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn check_internet_once_fails_fast_when_offline() {
        let result = check_internet_gate(&OfflineProbe, CheckInternetMixin::Once).await;
        match result {
            Err(WrappedError::User(err)) => assert_eq!(err.msg(), "No internet"),
            other => panic!("expected UserException, got {other:?}"),
        }
    }

    #[test]
    fn optimistic_sync_rejects_non_reentrant() {
        let mut policy = flux_core::action::ActionPolicy::none();
        policy.non_reentrant = true;
        assert!(assert_compatible_with_optimistic_sync(&policy).is_err());
    }

    #[test]
    fn optimistic_sync_allows_plain_policy() {
        let policy = flux_core::action::ActionPolicy::none();
        assert!(assert_compatible_with_optimistic_sync(&policy).is_ok());
    }
}
