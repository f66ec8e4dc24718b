//! Ergonomic Given-When-Then testing for [`Action`]s.
//!
//! Unlike a reducer-only test, an action's `before`/`reduce`/`after` and its
//! declared mixins can only be verified by actually running the executor:
//! [`ActionTest::run`] dispatches through [`flux_runtime::execute`], exactly
//! as the `Store` would.

#![allow(clippy::module_name_repetitions)] // ActionTest is the natural name

use std::sync::Arc;

use flux_core::action::{Action, ActionResult};
use flux_core::environment::ConnectivityProbe;
use flux_core::status::ActionStatus;
use flux_runtime::ExecutorContext;

use crate::mocks::FixedConnectivity;

type StateAssertion<S> = Box<dyn FnOnce(&S)>;
type StatusAssertion = Box<dyn FnOnce(&ActionStatus)>;
type ResultAssertion = Box<dyn FnOnce(&ActionResult<()>)>;

/// Fluent Given-When-Then harness for one action dispatch.
///
/// # Example
///
/// ```ignore
/// use flux_testing::ActionTest;
///
/// ActionTest::new(Increment)
///     .given_state(0)
///     .with_env(())
///     .then_state(|state| assert_eq!(*state, 1))
///     .then_status(|status| assert!(status.is_completed_ok()))
///     .run()
///     .await;
/// ```
pub struct ActionTest<A: Action> {
    action: A,
    environment: Option<A::Environment>,
    initial_state: Option<A::State>,
    connectivity: Arc<dyn ConnectivityProbe>,
    state_assertions: Vec<StateAssertion<A::State>>,
    status_assertions: Vec<StatusAssertion>,
    result_assertions: Vec<ResultAssertion>,
}

impl<A: Action> ActionTest<A> {
    /// Start a test for `action`. The connectivity probe defaults to always
    /// online; override with [`Self::with_connectivity`] to exercise
    /// `CheckInternet`.
    pub fn new(action: A) -> Self {
        Self {
            action,
            environment: None,
            initial_state: None,
            connectivity: Arc::new(FixedConnectivity::online()),
            state_assertions: Vec::new(),
            status_assertions: Vec::new(),
            result_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test (Given).
    #[must_use]
    pub fn with_env(mut self, env: A::Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given).
    #[must_use]
    pub fn given_state(mut self, state: A::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Override the connectivity probe (Given).
    #[must_use]
    pub fn with_connectivity(mut self, probe: impl ConnectivityProbe + 'static) -> Self {
        self.connectivity = Arc::new(probe);
        self
    }

    /// Add an assertion about the state after dispatch (Then).
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&A::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the terminal [`ActionStatus`] (Then).
    #[must_use]
    pub fn then_status<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&ActionStatus) + 'static,
    {
        self.status_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the dispatch's terminal `Result` (Then).
    #[must_use]
    pub fn then_result<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&ActionResult<()>) + 'static,
    {
        self.result_assertions.push(Box::new(assertion));
        self
    }

    /// Dispatch the action through the real executor and run every
    /// registered assertion.
    ///
    /// # Panics
    ///
    /// Panics if [`Self::given_state`] or [`Self::with_env`] was never
    /// called, or if any assertion fails.
    #[allow(clippy::expect_used)]
    pub async fn run(self) {
        let initial_state = self
            .initial_state
            .expect("initial state must be set with given_state()");
        let environment = self.environment.expect("environment must be set with with_env()");

        let ctx = ExecutorContext::new(initial_state);
        let status = ActionStatus::new();
        let result = flux_runtime::execute(
            &self.action,
            &environment,
            &ctx,
            self.connectivity.as_ref(),
            &status,
        )
        .await;

        let final_state = ctx.state_cell.get().await;
        for assertion in self.state_assertions {
            assertion(&final_state);
        }
        for assertion in self.status_assertions {
            assertion(&status);
        }
        for assertion in self.result_assertions {
            assertion(&result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::action::ReduceOutcome;

    struct Increment;
    impl Action for Increment {
        type State = i32;
        type Environment = ();

        fn reduce(&self, state: &i32, _env: &()) -> ReduceOutcome<i32> {
            ReduceOutcome::Sync(Ok(state + 1))
        }
    }

    #[tokio::test]
    async fn increment_reaches_completed_ok_with_updated_state() {
        ActionTest::new(Increment)
            .given_state(0)
            .with_env(())
            .then_state(|state| assert_eq!(*state, 1))
            .then_status(|status| assert!(status.is_completed_ok()))
            .then_result(|result| assert!(result.is_ok()))
            .run()
            .await;
    }
}
