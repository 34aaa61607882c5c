//! Configuration validation

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
///
/// Only checks the shape of the declarations. Cross references between
/// projects and phases are resolved when the operation graph is built.
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_execution(config)?;
    validate_phases(config)?;
    validate_projects(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.execution.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "execution.concurrency".to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }

    if config.execution.timeout_secs == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "execution.timeout_secs".to_string(),
            message: "must be greater than zero when set".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_phases(config: &Config) -> Result<()> {
    for (name, phase) in &config.phases {
        if name.trim().is_empty() || name.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "phases".to_string(),
                message: format!("invalid phase name '{}'", name),
            }
            .into());
        }
        if phase.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("phases.{}.command", name),
                message: "command cannot be empty".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn validate_projects(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for project in &config.projects {
        if project.name.trim().is_empty() || project.name.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "projects.name".to_string(),
                message: format!("invalid project name '{}'", project.name),
            }
            .into());
        }
        if !seen.insert(project.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "project",
                name: project.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}
