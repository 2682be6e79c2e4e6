//! Vigil CLI - operator tools for persisted session security state
//!
//! Inspect the lock record, run an inactivity evaluation against it,
//! wipe it on logout, or write a configuration template.

pub mod commands;

pub use commands::{run, Cli, Commands};
