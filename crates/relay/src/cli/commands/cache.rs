//! `relay cache` - inspect and trim the local build cache

use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;
use relay_tasks::LocalCacheStore;

use crate::cli::output;
use crate::cli::workspace::Workspace;
use crate::cli::{Cli, OutputFormat};

/// Inspect and trim the build cache
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Drop cached results older than an age such as `12h` or `7d`
    Prune {
        #[arg(long, value_name = "AGE", default_value = "7d", value_parser = parse_age)]
        older_than: Duration,
    },
    /// Show where the cache lives and how much it holds
    Status,
    /// Delete every cached result
    Clean {
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let workspace = Workspace::load(&std::env::current_dir()?)?;
        let store = workspace.cache();

        match self.action {
            CacheAction::Prune { older_than } => prune(cli, &store, older_than),
            CacheAction::Status => status(cli, &workspace, &store),
            CacheAction::Clean { yes } => clean(cli, &store, yes),
        }
    }
}

/// Parse `<number><unit>` with unit `s`, `m`, `h` or `d`
fn parse_age(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in '{}' (use s, m, h or d)", value))?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("invalid age '{}'", value))?;

    let seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(format!("unknown unit '{}' (use s, m, h or d)", other)),
    };
    Ok(Duration::from_secs(amount.saturating_mul(seconds)))
}

fn prune(cli: &Cli, store: &LocalCacheStore, older_than: Duration) -> anyhow::Result<()> {
    let stats = store.prune(older_than)?;

    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "older_than_secs": older_than.as_secs(),
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
            }))?
        ),
        OutputFormat::Text if !cli.quiet => output::success(&format!(
            "Pruned {} ({} kept)",
            output::plural(stats.removed, "cached result"),
            stats.kept
        )),
        OutputFormat::Text => {}
    }
    Ok(())
}

fn status(cli: &Cli, workspace: &Workspace, store: &LocalCacheStore) -> anyhow::Result<()> {
    let stats = store.status()?;
    let enabled = workspace.config.cache.enabled;

    if cli.format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "dir": store.cache_dir().display().to_string(),
                "enabled": enabled,
                "entries": stats.entries,
                "bytes": stats.total_size,
            }))?
        );
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    println!("{}", output::header("Cache"));
    println!(
        "  {}",
        output::key_value(
            "dir",
            &output::path_style().apply_to(store.cache_dir().display()).to_string()
        )
    );
    println!(
        "  {}",
        output::key_value(
            "holds",
            &format!(
                "{} ({})",
                output::plural(stats.entries, "result"),
                style(stats.formatted_size()).yellow()
            )
        )
    );
    if !enabled {
        output::warning("cache.enabled is false; runs neither read nor write it");
    }
    Ok(())
}

fn clean(cli: &Cli, store: &LocalCacheStore, yes: bool) -> anyhow::Result<()> {
    let dir = store.cache_dir();
    if !dir.exists() {
        if !cli.quiet {
            output::info("Nothing cached yet.");
        }
        return Ok(());
    }

    let confirmed = yes
        || dialoguer::Confirm::new()
            .with_prompt(format!("Delete every cached result under {}?", dir.display()))
            .default(false)
            .interact()?;
    if !confirmed {
        output::warning("Left the cache untouched.");
        return Ok(());
    }

    store.clean()?;
    if !cli.quiet {
        output::success(&format!(
            "Emptied {}",
            output::path_style().apply_to(dir.display())
        ));
    }
    Ok(())
}
