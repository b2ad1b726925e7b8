//! ADR orchestrator
//!
//! Schedules and drives automated invoice retrieval for vendor accounts:
//! billing-period projection, a persistent job state machine, an
//! idempotency ledger in front of the scraping provider, and a
//! single-active-run coordinator with a summary reporter.

pub mod application;
pub mod commands;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::AppState;
pub use infrastructure::config::{AppConfig, ConfigManager};
