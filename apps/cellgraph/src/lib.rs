//! # cellgraph
//!
//! Library half of the operator binary: CLI definitions, command handlers
//! and application configuration, exposed so integration tests can drive
//! commands without spawning a process.

pub mod cli;
pub mod config;
