//! Application layer
//!
//! Use cases over the domain: rule scheduling, the idempotency ledger, phase
//! execution, the run coordinator and end-of-run reporting.

pub mod coordinator;
pub mod idempotency;
pub mod phases;
pub mod reporter;
pub mod rule_scheduler;
pub mod state;

pub use coordinator::{CoordinatorError, RunCoordinator, StartRunRequest, StartedRun};
pub use state::AppState;
