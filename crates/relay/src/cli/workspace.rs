//! Loading the workspace described by the configuration file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use relay_core::config::{load_config_or_default, workspace_root};
use relay_core::Config;
use relay_tasks::{
    FsHashProvider, LocalCacheStore, OperationGraph, Phase, Project, ProjectChangeAnalyzer,
    ProjectSelection,
};

/// Configuration plus the projects and phases it declares
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: Config,
    pub projects: Vec<Project>,
    pub phases: Vec<Phase>,
}

impl Workspace {
    /// Find and load the configuration for `dir`
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let (config, config_path) =
            load_config_or_default(dir).context("Failed to load configuration")?;
        let root = workspace_root(config_path.as_deref(), dir);

        let projects = config.projects.iter().map(Project::from_config).collect();
        let phases = config
            .phases
            .iter()
            .map(|(name, phase)| Phase::from_config(name, phase))
            .collect();

        Ok(Self {
            root,
            config,
            projects,
            phases,
        })
    }

    /// Build the operation graph for `phases`
    pub fn graph(
        &self,
        phases: &[String],
        only: &[String],
        to: &[String],
    ) -> anyhow::Result<OperationGraph> {
        let selection = if !only.is_empty() {
            ProjectSelection::Only(only.to_vec())
        } else if !to.is_empty() {
            ProjectSelection::To(to.to_vec())
        } else {
            ProjectSelection::All
        };

        Ok(OperationGraph::build(
            &self.projects,
            &self.phases,
            phases,
            &selection,
        )?)
    }

    /// Change analyzer over the workspace files
    pub fn analyzer(&self) -> anyhow::Result<ProjectChangeAnalyzer> {
        let provider = FsHashProvider::new(&self.root, &self.config.analyzer.ignore)
            .context("Invalid analyzer ignore pattern")?;
        Ok(ProjectChangeAnalyzer::new(
            Arc::new(provider),
            &self.projects,
            self.config.analyzer.shared_files.clone(),
        ))
    }

    /// Cache store at the configured location
    pub fn cache(&self) -> LocalCacheStore {
        LocalCacheStore::new(self.root.join(&self.config.cache.dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[phases.build]
command = "make"
upstream = true

[phases.test]
command = "make test"
depends_on = ["build"]

[[projects]]
name = "core"
folder = "core"

[[projects]]
name = "app"
folder = "app"
dependencies = ["core"]
"#;

    #[test]
    fn test_load_from_nested_directory() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("relay.toml"), CONFIG).unwrap();
        let nested = temp.path().join("app/src");
        std::fs::create_dir_all(&nested).unwrap();

        let ws = Workspace::load(&nested).unwrap();

        assert_eq!(ws.root, temp.path());
        assert_eq!(ws.projects.len(), 2);
        assert_eq!(ws.phases.len(), 2);
        assert_eq!(ws.cache().cache_dir(), temp.path().join(".relay/cache"));
    }

    #[test]
    fn test_graph_selection() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("relay.toml"), CONFIG).unwrap();
        let ws = Workspace::load(temp.path()).unwrap();

        let all = ws.graph(&["test".to_string()], &[], &[]).unwrap();
        assert_eq!(all.len(), 4);

        let only = ws
            .graph(&["build".to_string()], &["app".to_string()], &[])
            .unwrap();
        assert_eq!(only.len(), 1);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::load(temp.path()).unwrap();

        assert_eq!(ws.root, temp.path());
        assert!(ws.projects.is_empty());
    }
}
