//! Command-line interface for roast-forge.
//!
//! Provides commands for full pipeline runs, one-off scoring, publication of
//! an exported roast file, and inspection of the publication history.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
