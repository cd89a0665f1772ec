//! CLI command handlers
//!
//! Each subcommand is implemented in its own module.

pub mod config;
pub mod health;
pub mod helpers;
pub mod history;
pub mod rollback;
pub mod run;
