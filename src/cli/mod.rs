//! Command-line interface for cotflow
//!
//! ## Module Structure
//!
//! - `args`: CLI argument definitions and parsing structures (clap)
//! - `run`: Main entry point and command dispatch
//! - `commands`: Command implementations and helpers

pub mod args;
mod commands;
mod run;

pub use args::{Cli, Commands, StepArg, build_cli};
pub use run::{run, run_with};
