//! # Flux Core
//!
//! Core traits and types for an asynchronous, single-store state management
//! engine.
//!
//! The engine owns a single immutable state value and mutates it only
//! through the controlled execution of *actions*: units of intent with a
//! three-phase lifecycle (`before -> reduce -> after`), tracked by an
//! [`ActionStatus`](status::ActionStatus) and dispatched through a `Store`
//! (see the `flux-runtime` crate).
//!
//! ## Core Concepts
//!
//! - [`action::Action`]: a unit of intent — `before`/`reduce`/`after`, plus a
//!   declarative [`action::ActionPolicy`] for concurrency mixins.
//! - [`status::ActionStatus`]: the observable lifecycle of one dispatch.
//! - [`error`]: the error taxonomy (`StoreException`/`UserException`/
//!   `TimeoutException`) and the pipeline's terminal [`error::WrappedError`].
//! - [`event::Event`]: a single-fire value payload embedded in state.
//! - [`optimistic`]: capability traits for the optimistic-update/sync mixins.
//! - [`environment::Clock`] / [`environment::ConnectivityProbe`]: the
//!   concrete injected dependencies kept as examples; everything else about
//!   `Environment` is opaque user data.

pub mod action;
pub mod environment;
pub mod error;
pub mod event;
pub mod optimistic;
pub mod status;

pub use action::{
    Action, ActionPolicy, ActionResult, AfterOutcome, BeforeOutcome, BoxFuture, LockKey,
    ReduceOutcome, RetryMixin,
};
pub use error::{StoreException, TimeoutException, UserException, WrappedError};
pub use event::Event;
pub use status::ActionStatus;
