//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// winrecon - Declarative Windows fleet reconciliation.
#[derive(Parser, Debug)]
#[command(name = "winrecon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the desired-state document.
    #[arg(short, long, global = true, env = "WINRECON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse and validate the desired-state document.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Observe live state and print the reconciliation plan.
    Plan {
        /// Show attribute-level differences.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Build the plan and apply it.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the last reconciliation report.
    Report,

    /// List resources whose live state differs from the document.
    Drift,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_global_flags() {
        let cli = Cli::parse_from([
            "winrecon",
            "apply",
            "--yes",
            "--config",
            "fleet.yaml",
            "--output",
            "json",
        ]);
        assert!(matches!(cli.command, Commands::Apply { yes: true }));
        assert_eq!(cli.config, Some(PathBuf::from("fleet.yaml")));
        assert_eq!(cli.output, OutputFormat::Json);
    }

    #[test]
    fn test_parse_plan_defaults() {
        let cli = Cli::parse_from(["winrecon", "plan"]);
        assert!(matches!(cli.command, Commands::Plan { detailed: false }));
        assert_eq!(cli.output, OutputFormat::Text);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["winrecon", "destroy"]).is_err());
    }
}
