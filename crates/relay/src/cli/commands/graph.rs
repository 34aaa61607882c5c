//! Graph command - show the operation graph without running it

use clap::Args;

use crate::cli::output;
use crate::cli::workspace::Workspace;
use crate::cli::{Cli, OutputFormat};

/// Show the operation graph for a set of phases
#[derive(Debug, Args)]
pub struct GraphCommand {
    /// Phases to plan (e.g., build test)
    #[arg(required = true)]
    pub phases: Vec<String>,

    /// Only include these projects (can be repeated)
    #[arg(long, conflicts_with = "to")]
    pub only: Vec<String>,

    /// Include these projects and everything they depend on (can be repeated)
    #[arg(long)]
    pub to: Vec<String>,
}

impl GraphCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = Workspace::load(&cwd)?;
        let graph = workspace.graph(&self.phases, &self.only, &self.to)?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&graph.snapshot())?);
            return Ok(());
        }

        if cli.quiet {
            return Ok(());
        }

        println!(
            "{}",
            output::header(&format!(
                "{} ({})",
                self.phases.join(", "),
                output::plural(graph.len(), "operation")
            ))
        );
        println!();
        if graph.is_empty() {
            output::info("No operations selected.");
        } else {
            print!("{}", graph.execution_plan());
        }

        if cli.verbose {
            println!();
            for node in graph.nodes() {
                println!(
                    "{}",
                    output::key_value(
                        &node.id.to_string(),
                        &format!("criticality {}, depth {}", node.criticality, node.depth)
                    )
                );
            }
        }

        Ok(())
    }
}
