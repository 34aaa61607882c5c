//! Output formatting utilities

use console::{style, Style, StyledObject};
use relay_tasks::OperationStatus;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Style for content hashes
pub fn hash_style() -> Style {
    Style::new().yellow()
}

/// Symbol shown next to an operation in its final status
pub fn status_symbol(status: OperationStatus) -> StyledObject<&'static str> {
    match status {
        OperationStatus::Success | OperationStatus::FromCache => style("✓").green(),
        OperationStatus::SuccessWithWarnings => style("!").yellow(),
        OperationStatus::Failure => style("✗").red(),
        OperationStatus::NoOp => style("-").dim(),
        _ => style("○").yellow(),
    }
}

/// `n thing` / `n things`
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}
