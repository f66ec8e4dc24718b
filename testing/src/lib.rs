//! # Flux Testing
//!
//! Testing utilities for the flux action/state engine:
//! - [`mocks::FixedClock`] / [`mocks::FixedConnectivity`]: deterministic
//!   implementations of the injected [`flux_core::environment`] traits.
//! - [`action_test::ActionTest`]: a fluent Given-When-Then harness that
//!   drives one action through the real executor and asserts on its
//!   resulting state, status, and terminal result.
//!
//! ## Example
//!
//! ```ignore
//! use flux_testing::ActionTest;
//!
//! ActionTest::new(Increment)
//!     .with_env(())
//!     .given_state(0)
//!     .then_state(|state| assert_eq!(*state, 1))
//!     .then_status(|status| assert!(status.is_completed_ok()))
//!     .run()
//!     .await;
//! ```

pub mod action_test;

/// Deterministic implementations of the injected [`flux_core::environment`]
/// traits.
pub mod mocks {
    use chrono::{DateTime, Utc};
    use flux_core::action::BoxFuture;
    use flux_core::environment::{Clock, ConnectivityProbe};

    /// Fixed clock for deterministic tests.
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flux_testing::mocks::FixedClock;
    /// use flux_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// A [`ConnectivityProbe`] that always reports the same fixed answer.
    ///
    /// # Example
    ///
    /// ```
    /// use flux_testing::mocks::FixedConnectivity;
    /// use flux_core::environment::ConnectivityProbe;
    ///
    /// # tokio_test::block_on(async {
    /// let probe = FixedConnectivity::online();
    /// assert!(probe.is_online().await);
    /// # });
    /// ```
    #[derive(Debug, Clone, Copy)]
    pub struct FixedConnectivity {
        online: bool,
    }

    impl FixedConnectivity {
        /// A probe that always reports connectivity.
        #[must_use]
        pub const fn online() -> Self {
            Self { online: true }
        }

        /// A probe that always reports no connectivity.
        #[must_use]
        pub const fn offline() -> Self {
            Self { online: false }
        }
    }

    impl ConnectivityProbe for FixedConnectivity {
        fn is_online(&self) -> BoxFuture<'static, bool> {
            let online = self.online;
            Box::pin(async move { online })
        }
    }
}

pub use action_test::ActionTest;
pub use mocks::{test_clock, FixedClock, FixedConnectivity};

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::environment::Clock;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[tokio::test]
    async fn test_fixed_connectivity() {
        use flux_core::environment::ConnectivityProbe;
        assert!(FixedConnectivity::online().is_online().await);
        assert!(!FixedConnectivity::offline().is_online().await);
    }
}
