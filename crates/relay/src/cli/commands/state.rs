//! State command - per-project state hashes and change detection

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use console::style;

use crate::cli::output;
use crate::cli::workspace::Workspace;
use crate::cli::{Cli, OutputFormat};

/// Show project state hashes
#[derive(Debug, Args)]
pub struct StateCommand {
    /// Compare against hashes previously saved with --save and list changed projects
    #[arg(long, value_name = "FILE")]
    pub previous: Option<PathBuf>,

    /// Save the current hashes as JSON
    #[arg(long, value_name = "FILE")]
    pub save: Option<PathBuf>,
}

impl StateCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = Workspace::load(&cwd)?;
        let analyzer = workspace.analyzer()?;

        let hashes = analyzer
            .state_hashes()
            .context("Failed to compute project state")?;

        if let Some(path) = &self.save {
            std::fs::write(path, serde_json::to_string_pretty(&hashes)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        let Some(previous_path) = &self.previous else {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&hashes)?);
            } else if !cli.quiet {
                println!("{}", output::header("Project State"));
                println!();
                for (project, hash) in &hashes {
                    println!(
                        "{}",
                        output::key_value(project, &output::hash_style().apply_to(short(hash)).to_string())
                    );
                }
            }
            return Ok(());
        };

        let previous = read_hashes(previous_path)?;
        let changed = analyzer.changed_projects(&previous)?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&changed)?);
        } else if !cli.quiet {
            if changed.is_empty() {
                output::success(&format!(
                    "No projects changed since {}",
                    output::path_style().apply_to(previous_path.display())
                ));
            } else {
                output::info(&format!(
                    "{} changed:",
                    output::plural(changed.len(), "project")
                ));
                for project in &changed {
                    println!("  {} {}", style("•").yellow(), project);
                }
            }
        }

        Ok(())
    }
}

fn read_hashes(path: &std::path::Path) -> anyhow::Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid state file {}", path.display()))
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
