//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(
        path = %path.display(),
        phases = config.phases.len(),
        projects = config.projects.len(),
        "config loaded and validated"
    );
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// The first name from [`config_file_names`] found wins at each level;
/// parents are walked until the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or fall back to defaults when no file exists.
///
/// A file that exists but fails to parse or validate is still an error.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

/// Directory the configuration file lives in; the workspace root.
pub fn workspace_root(config_path: Option<&Path>, fallback: &Path) -> PathBuf {
    config_path
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| fallback.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE_TOML: &str = r#"
[execution]
concurrency = 2

[phases.build]
upstream = true
command = "make"

[phases.test]
depends_on = ["build"]

[[projects]]
name = "core"
folder = "packages/core"

[[projects]]
name = "app"
folder = "packages/app"
dependencies = ["core"]
[projects.commands]
build = "make app"
"#;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("relay.toml");
        std::fs::write(&config_path, SAMPLE_TOML).unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("relay.toml");
        let yaml_path = temp.path().join("relay.yaml");
        std::fs::write(&toml_path, SAMPLE_TOML).unwrap();
        std::fs::write(&yaml_path, "execution:\n  concurrency: 1\n").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("relay.toml");
        std::fs::write(&config_path, SAMPLE_TOML).unwrap();
        let nested = temp.path().join("packages").join("core");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("relay.toml");
        std::fs::write(&config_path, SAMPLE_TOML).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(config.projects.len(), 2);
        assert_eq!(config.projects[1].dependencies, vec!["core"]);
        assert_eq!(config.projects[1].commands["build"], "make app");
        assert!(config.phases["test"].cacheable);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("relay.yaml");
        std::fs::write(
            &config_path,
            "phases:\n  lint:\n    command: eslint .\n    config:\n      strict: true\nprojects:\n  - name: web\n    folder: web\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.phases["lint"].command.as_deref(), Some("eslint ."));
        assert_eq!(config.phases["lint"].config["strict"], serde_json::json!(true));
        assert_eq!(config.projects[0].name, "web");
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path()).unwrap();
        assert!(path.is_none());
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_load_or_default_propagates_invalid_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("relay.toml"),
            "[execution]\nconcurrency = 0\n",
        )
        .unwrap();

        assert!(load_config_or_default(temp.path()).is_err());
    }

    #[test]
    fn test_workspace_root() {
        let root = workspace_root(Some(Path::new("/repo/relay.toml")), Path::new("/cwd"));
        assert_eq!(root, PathBuf::from("/repo"));
        assert_eq!(workspace_root(None, Path::new("/cwd")), PathBuf::from("/cwd"));
    }
}
