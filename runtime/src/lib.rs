//! # Flux Runtime
//!
//! The dispatch runtime for the flux action/state engine: the [`Store`]
//! facade, the [`executor`] that drives one action's `before -> reduce ->
//! after` lifecycle, the gating mixins, the optimistic-sync algorithms, and
//! the wait/notification substrate they all share.
//!
//! ## Example
//!
//! ```ignore
//! use flux_runtime::Store;
//! use std::sync::Arc;
//!
//! let store = Store::new(initial_state, environment, connectivity_probe);
//! let status = store.dispatch_and_wait(MyAction).await?;
//! assert!(status.is_completed_ok());
//! ```

pub mod executor;
pub mod metrics;
pub mod mixins;
pub mod notifier;
pub mod optimistic;
pub mod retry;
pub mod state_cell;
pub mod store;
pub mod wait_registry;

pub use executor::{execute, ExecutorContext};
pub use mixins::{GateOutcome, MixinGates, NonReentrantGuard};
pub use notifier::{ListenerId, Notifier};
pub use optimistic::{
    apply_server_push, run_optimistic_sync, run_optimistic_sync_with_push, run_optimistic_update,
    OptimisticSyncRegistry,
};
pub use state_cell::StateCell;
pub use store::Store;
pub use wait_registry::{Ticket, WaitRegistry};
