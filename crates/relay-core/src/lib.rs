//! Relay Core - shared foundations for the Relay build orchestrator
//!
//! This crate provides the error taxonomy and the configuration layer
//! (project and phase declarations, execution settings) consumed by the
//! task engine and the CLI.

pub mod config;
pub mod error;

pub use config::{
    find_config, load_config, load_config_from_dir, load_config_or_default, Config,
};
pub use error::{ConfigError, RelayError, Result};
