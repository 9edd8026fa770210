//! Command-line interface for winrecon.
//!
//! This module provides the argument definitions and the output formatting
//! used by the `winrecon` binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat};
pub use output::OutputFormatter;
