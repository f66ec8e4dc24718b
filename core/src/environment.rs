//! Dependency injection traits for the `Environment` an action is dispatched
//! against.
//!
//! `spec.md`'s `Environment<E>` is opaque user data; `Clock` is the one
//! concrete capability kept from the teacher as the canonical example of an
//! injected, swappable dependency (production uses the system clock, tests
//! use a fixed one).

use chrono::{DateTime, Utc};

/// Abstracts time operations for testability.
///
/// ```
/// use flux_core::environment::Clock;
/// use chrono::{DateTime, Utc};
///
/// struct SystemClock;
/// impl Clock for SystemClock {
///     fn now(&self) -> DateTime<Utc> {
///         Utc::now()
///     }
/// }
/// ```
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Abstracts the connectivity probe the `CheckInternet` mixin polls.
///
/// Production environments wire this to a real network reachability check;
/// tests wire it to a canned answer (see `flux-testing`'s `FixedConnectivity`).
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the device currently has a usable internet connection.
    fn is_online(&self) -> crate::action::BoxFuture<'static, bool>;
}
