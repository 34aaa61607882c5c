//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for Relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Repository name
    pub name: Option<String>,

    /// Scheduler settings
    pub execution: ExecutionConfig,

    /// Build cache settings
    pub cache: CacheConfig,

    /// Change analysis settings
    pub analyzer: AnalyzerConfig,

    /// Phase declarations keyed by phase name
    pub phases: BTreeMap<String, PhaseConfig>,

    /// Project declarations
    pub projects: Vec<ProjectConfig>,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of operations executing at once
    pub concurrency: usize,

    /// Stop dispatching new operations after the first failure
    pub abort_on_failure: bool,

    /// Per-operation timeout in seconds (none = unbounded)
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            abort_on_failure: false,
            timeout_secs: None,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Cache directory, relative to the workspace root
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".relay/cache"),
        }
    }
}

/// Change analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Repository-relative files that affect every project (lockfiles)
    pub shared_files: Vec<PathBuf>,

    /// Glob patterns excluded from project state hashing
    pub ignore: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            shared_files: Vec::new(),
            ignore: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                ".relay/**".to_string(),
            ],
        }
    }
}

/// A phase declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Default shell command for projects that do not override it
    pub command: Option<String>,

    /// Phases in the same project that must complete first
    pub depends_on: Vec<String>,

    /// Whether the same phase must complete in dependency projects first
    pub upstream: bool,

    /// Environment variables passed to the command
    pub env: BTreeMap<String, String>,

    /// Whether results of this phase may be served from the cache
    pub cacheable: bool,

    /// Free-form configuration, folded into the fingerprint
    pub config: serde_json::Value,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            command: None,
            depends_on: Vec::new(),
            upstream: false,
            env: BTreeMap::new(),
            cacheable: true,
            config: serde_json::Value::Null,
        }
    }
}

/// A project declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Unique project name
    pub name: String,

    /// Folder relative to the workspace root
    pub folder: PathBuf,

    /// Names of projects this project depends on
    pub dependencies: Vec<String>,

    /// Dependencies allowed to form a cycle; no ordering edges are derived from them
    pub cyclic_dependencies: Vec<String>,

    /// Phases this project participates in (empty = every declared phase)
    pub phases: Vec<String>,

    /// Per-phase command overrides
    pub commands: BTreeMap<String, String>,
}
