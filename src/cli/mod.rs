//! Command-line interface for waveflow.
//!
//! Provides the `serve` command that runs the full engine, plus small
//! operational commands for submitting and inspecting jobs.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
