//! Command-line interface for the diff calculator.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, MigrateArgs, RunArgs};
