//! Infrastructure layer
//!
//! SQLite repositories, the HTTP provider client, the account feed reader,
//! notification sinks, configuration and logging.

pub mod account_feed;
pub mod account_repository;
pub mod config;
pub mod database_connection;
pub mod job_repository;
pub mod logging;
pub mod notification;
pub mod provider_client;
pub mod run_repository;

pub use database_connection::DatabaseConnection;
