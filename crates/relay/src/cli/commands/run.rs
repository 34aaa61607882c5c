//! Run command - execute phases across the workspace

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;

use relay_tasks::fingerprint::StateHashSource;
use relay_tasks::{
    BuildEvent, BuildOutcome, ExecutorOptions, OperationExecutor, OperationStatus, ResultSink,
    ShellRunner, SinkRegistry, TracingSink,
};
use tokio_util::sync::CancellationToken;

use crate::cli::output;
use crate::cli::workspace::Workspace;
use crate::cli::{Cli, OutputFormat};

/// Build ended without success
#[derive(Debug, thiserror::Error)]
pub enum BuildFailure {
    #[error("{}", failed_message(.0))]
    Failed(usize),

    #[error("Build cancelled")]
    Cancelled,
}

fn failed_message(count: &usize) -> String {
    format!("{} failed", output::plural(*count, "operation"))
}

/// Run phases across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Phases to run (e.g., build test)
    #[arg(required = true)]
    pub phases: Vec<String>,

    /// Only run these projects (can be repeated)
    #[arg(long, conflicts_with = "to")]
    pub only: Vec<String>,

    /// Run these projects and everything they depend on (can be repeated)
    #[arg(long)]
    pub to: Vec<String>,

    /// Maximum concurrent operations
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Stop dispatching new operations after the first failure
    #[arg(long)]
    pub abort_on_failure: bool,

    /// Disable the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// Write the graph topology as JSON to this file before running
    #[arg(long, value_name = "FILE")]
    pub snapshot: Option<PathBuf>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = Workspace::load(&cwd)?;
        let config = &workspace.config;

        let graph = workspace.graph(&self.phases, &self.only, &self.to)?;

        if graph.is_empty() {
            if !cli.quiet {
                output::success("No operations to run.");
            }
            return Ok(());
        }

        if cli.format == OutputFormat::Text && !cli.quiet {
            println!();
            output::info(&format!(
                "{} across {}",
                output::plural(graph.len(), "operation"),
                output::plural(workspace.projects.len(), "project"),
            ));

            if cli.verbose || self.dry_run {
                println!();
                println!("{}", graph.execution_plan());
            }

            if self.dry_run {
                println!(
                    "{}",
                    style("[DRY RUN - no operations will be executed]").yellow().bold()
                );
                return Ok(());
            }

            println!();
        }

        if self.dry_run {
            if cli.format == OutputFormat::Json {
                let plan: Vec<String> = graph.sorted_ids().iter().map(|id| id.to_string()).collect();
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            return Ok(());
        }

        let options = ExecutorOptions {
            concurrency: self.concurrency.unwrap_or(config.execution.concurrency),
            abort_on_failure: self.abort_on_failure || config.execution.abort_on_failure,
            root_dir: workspace.root.clone(),
            emit_snapshot: self.snapshot.is_some(),
        };

        let mut runner = ShellRunner::new();
        if let Some(secs) = config.execution.timeout_secs {
            runner = runner.with_timeout(Duration::from_secs(secs));
        }

        let mut sinks = SinkRegistry::empty();
        if cli.quiet || cli.format == OutputFormat::Json {
            sinks.register(TracingSink);
        } else {
            sinks.register(ConsoleSink::new(cli.verbose));
        }
        if let Some(path) = &self.snapshot {
            sinks.register(SnapshotFileSink { path: path.clone() });
        }

        let mut executor =
            OperationExecutor::new(options, Arc::new(runner)).with_sink(Arc::new(sinks));

        if !self.no_cache && config.cache.enabled {
            let states: Arc<dyn StateHashSource> = Arc::new(workspace.analyzer()?);
            executor = executor.with_cache(Arc::new(workspace.cache()), states);
        }

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing running operations");
                on_interrupt.cancel();
            }
        });

        let result = executor.run(Arc::new(graph), cancel).await;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        let failed: Vec<_> = result
            .operations
            .iter()
            .filter(|r| r.status == OperationStatus::Failure)
            .collect();

        if !failed.is_empty() && !cli.quiet && cli.format == OutputFormat::Text {
            println!();
            println!(
                "  {} {}/{} operations failed:",
                style("✗").red().bold(),
                failed.len(),
                result.operations.len()
            );
            for record in &failed {
                println!(
                    "    {} {}: {}",
                    style("✗").red(),
                    record.id,
                    record.error.as_deref().unwrap_or("failed")
                );
                if cli.verbose && !record.log.is_empty() {
                    for line in record.log.lines() {
                        println!("      {}", style(line).dim());
                    }
                }
            }
        }

        match result.outcome {
            BuildOutcome::Success => Ok(()),
            BuildOutcome::Failure => Err(BuildFailure::Failed(failed.len()).into()),
            BuildOutcome::Cancelled => Err(BuildFailure::Cancelled.into()),
        }
    }
}

/// Console sink with live progress
struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ResultSink for ConsoleSink {
    fn report(&self, event: &BuildEvent) {
        match event {
            BuildEvent::GraphSnapshot(_) => {}
            BuildEvent::OperationStarted { id, command } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(id).bold(),
                    match (self.verbose, command) {
                        (true, Some(command)) => style(format!("({})", command)).dim().to_string(),
                        _ => String::new(),
                    }
                );
            }
            BuildEvent::OperationFinished {
                id,
                status,
                duration,
                from_cache,
            } => {
                let symbol = output::status_symbol(*status);
                let timing = style(format!("{:.1}s", duration.as_secs_f64())).dim();
                match status {
                    OperationStatus::Failure => {
                        println!("  {} {} {}", symbol, style(id).red(), timing)
                    }
                    _ if *from_cache => {
                        println!("  {} {} {}", symbol, style(id).green(), style("(cached)").cyan())
                    }
                    OperationStatus::NoOp => {
                        if self.verbose {
                            println!("  {} {} {}", symbol, style(id).dim(), style("(no-op)").dim())
                        }
                    }
                    OperationStatus::SuccessWithWarnings => {
                        println!(
                            "  {} {} {} {}",
                            symbol,
                            style(id).yellow(),
                            style("(warnings)").yellow(),
                            timing
                        )
                    }
                    _ => println!("  {} {} {}", symbol, style(id).green(), timing),
                }
            }
            // Followed by a skip event that carries the same information
            BuildEvent::OperationBlocked { .. } => {}
            BuildEvent::OperationSkipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    output::status_symbol(OperationStatus::Skipped),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            BuildEvent::Advisory { id, message } => {
                output::warning(&format!("{}: {}", id, message));
            }
            BuildEvent::RunFinished {
                outcome,
                total,
                succeeded,
                failed,
                skipped,
                from_cache,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s)",
                    match outcome {
                        BuildOutcome::Success => style("✓").green().bold(),
                        BuildOutcome::Failure => style("✗").red().bold(),
                        BuildOutcome::Cancelled => style("○").yellow().bold(),
                    },
                    succeeded,
                    total,
                    failed,
                    skipped,
                    from_cache,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Writes the graph snapshot to a file for processes watching the build
struct SnapshotFileSink {
    path: PathBuf,
}

impl ResultSink for SnapshotFileSink {
    fn report(&self, event: &BuildEvent) {
        let BuildEvent::GraphSnapshot(snapshot) = event else {
            return;
        };
        let written = serde_json::to_string_pretty(snapshot)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write graph snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_tasks::{GraphSnapshot, OperationId};
    use tempfile::TempDir;

    #[test]
    fn test_build_failure_messages() {
        assert_eq!(BuildFailure::Failed(1).to_string(), "1 operation failed");
        assert_eq!(BuildFailure::Failed(2).to_string(), "2 operations failed");
        assert_eq!(BuildFailure::Cancelled.to_string(), "Build cancelled");
    }

    #[test]
    fn test_snapshot_sink_writes_only_snapshots() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("graph.json");
        let sink = SnapshotFileSink { path: path.clone() };

        sink.report(&BuildEvent::Advisory {
            id: OperationId::new("core", "build"),
            message: "ignored".to_string(),
        });
        assert!(!path.exists());

        let snapshot = GraphSnapshot { operations: vec![] };
        sink.report(&BuildEvent::GraphSnapshot(snapshot.clone()));

        let written: GraphSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, snapshot);
    }
}
