//! Command-line interface for envforge.
//!
//! Provides commands for building environments, running stage workers and
//! showing the effective configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
