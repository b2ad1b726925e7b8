//! Run control surface
//!
//! Each command module lives in the commands/ directory; the public entry
//! points are re-exported here.

pub mod run_commands;

pub use run_commands::*;
