//! CLI definition and command handling

pub mod commands;
pub mod output;
mod workspace;

use clap::{Parser, Subcommand};

use commands::{CacheCommand, GraphCommand, RunCommand, StateCommand};

/// Relay - incremental monorepo build orchestrator
#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run phases across the workspace
    Run(RunCommand),

    /// Show the operation graph without running it
    Graph(GraphCommand),

    /// Show project state hashes
    State(StateCommand),

    /// Build cache management
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Run(ref cmd) => cmd.execute(&self),
            Commands::Graph(ref cmd) => cmd.execute(&self),
            Commands::State(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "relay", "run", "build", "test", "--to", "app", "-j", "3", "--format", "json",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Run(cmd) => {
                assert_eq!(cmd.phases, vec!["build", "test"]);
                assert_eq!(cmd.to, vec!["app"]);
                assert_eq!(cmd.concurrency, Some(3));
                assert!(!cmd.no_cache);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_only_conflicts_with_to() {
        let result = Cli::try_parse_from(["relay", "run", "build", "--only", "a", "--to", "b"]);
        assert!(result.is_err());
    }
}
