//! Exit codes for the CLI

use relay_core::{ConfigError, RelayError};
use relay_tasks::GraphError;

use crate::cli::commands::BuildFailure;

/// Success
pub const SUCCESS: i32 = 0;

/// General error, including failed builds
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Map an error to the process exit code
pub fn from_error(err: &anyhow::Error) -> i32 {
    if let Some(BuildFailure::Cancelled) = err.downcast_ref::<BuildFailure>() {
        return CANCELLED;
    }
    if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<GraphError>().is_some() {
        return CONFIG_ERROR;
    }
    match err.downcast_ref::<RelayError>() {
        Some(e) if e.is_config() => CONFIG_ERROR,
        _ => ERROR,
    }
}
