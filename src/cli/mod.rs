//! Command-line interface for trialforge.
//!
//! Provides the `run`, `list` and `validate` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
