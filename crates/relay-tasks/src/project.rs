//! Project and phase declarations

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use relay_core::config::{PhaseConfig, ProjectConfig};

/// A unit of source code taking part in the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project name
    pub name: String,

    /// Folder relative to the workspace root
    pub folder: PathBuf,

    /// Projects this project depends on
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Dependencies that are allowed to be cyclic and never produce edges
    #[serde(default)]
    pub cyclic_dependencies: BTreeSet<String>,

    /// Phases this project participates in (empty = all declared phases)
    #[serde(default)]
    pub phases: BTreeSet<String>,

    /// Per-phase command overrides
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

impl Project {
    /// Create a new project
    pub fn new(name: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            dependencies: BTreeSet::new(),
            cyclic_dependencies: BTreeSet::new(),
            phases: BTreeSet::new(),
            commands: BTreeMap::new(),
        }
    }

    /// Build a project from its configuration entry
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            name: config.name.clone(),
            folder: config.folder.clone(),
            dependencies: config.dependencies.iter().cloned().collect(),
            cyclic_dependencies: config.cyclic_dependencies.iter().cloned().collect(),
            phases: config.phases.iter().cloned().collect(),
            commands: config.commands.clone(),
        }
    }

    /// Add a project dependency
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Allow a dependency to be part of a cycle
    pub fn with_cyclic_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        self.dependencies.insert(dep.clone());
        self.cyclic_dependencies.insert(dep);
        self
    }

    /// Restrict the phases this project takes part in
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phases.insert(phase.into());
        self
    }

    /// Override the command of one phase
    pub fn with_command(mut self, phase: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.insert(phase.into(), command.into());
        self
    }

    /// Whether this project selects the given phase
    pub fn selects(&self, phase: &str) -> bool {
        self.phases.is_empty() || self.phases.contains(phase)
    }

    /// Dependencies that produce ordering edges
    pub fn ordering_dependencies(&self) -> impl Iterator<Item = &String> {
        self.dependencies
            .iter()
            .filter(|d| !self.cyclic_dependencies.contains(*d))
    }
}

/// A named build step shared by every project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase name (e.g., "build", "test")
    pub name: String,

    /// Default command for projects without an override
    #[serde(default)]
    pub command: Option<String>,

    /// Phases in the same project that must complete first
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Whether the same phase must complete in dependency projects first
    #[serde(default)]
    pub upstream: bool,

    /// Environment variables passed to the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Whether results may be served from the cache
    #[serde(default = "default_true")]
    pub cacheable: bool,

    /// Free-form configuration payload
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl Phase {
    /// Create a new phase
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            depends_on: BTreeSet::new(),
            upstream: false,
            env: BTreeMap::new(),
            cacheable: true,
            config: serde_json::Value::Null,
        }
    }

    /// Build a phase from its configuration entry
    pub fn from_config(name: impl Into<String>, config: &PhaseConfig) -> Self {
        Self {
            name: name.into(),
            command: config.command.clone(),
            depends_on: config.depends_on.iter().cloned().collect(),
            upstream: config.upstream,
            env: config.env.clone(),
            cacheable: config.cacheable,
            config: config.config.clone(),
        }
    }

    /// Set the default command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Add a same-project phase dependency
    pub fn with_depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Set whether this phase waits for the same phase in dependency projects
    pub fn with_upstream(mut self, upstream: bool) -> Self {
        self.upstream = upstream;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set whether results may be cached
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Set the configuration payload
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Command the given project runs for this phase, if any
    pub fn command_for<'a>(&'a self, project: &'a Project) -> Option<&'a str> {
        project
            .commands
            .get(&self.name)
            .map(String::as_str)
            .or(self.command.as_deref())
    }
}
