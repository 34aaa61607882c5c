//! Project change analysis
//!
//! Maps the repository's file hashes onto projects and derives one
//! deterministic state hash per project. Results are memoized for the lifetime
//! of one analyzer, which is created per build run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::hasher::ContentHasher;
use crate::project::Project;

/// Repository-relative path (always `/`-separated) to content hash
pub type FileHashes = BTreeMap<String, String>;

/// Source of file content hashes
pub trait FileHashProvider: Send + Sync {
    /// Hash every tracked file under a workspace-relative folder
    fn hash_folder(&self, folder: &Path) -> Result<FileHashes, HashProviderError>;

    /// Hash specific workspace-relative files
    fn hash_files(&self, paths: &[PathBuf]) -> Result<FileHashes, HashProviderError>;
}

/// Errors raised by a [`FileHashProvider`]
#[derive(Debug, thiserror::Error)]
pub enum HashProviderError {
    /// Folder does not exist
    #[error("Folder not found: {0}")]
    MissingFolder(PathBuf),

    /// File does not exist
    #[error("File not found: {0}")]
    MissingFile(PathBuf),

    /// Failed to read a file
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to walk a folder
    #[error("Failed to walk folder: {0}")]
    Walk(#[from] ignore::Error),

    /// Invalid ignore pattern
    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// Errors surfaced by the analyzer.
///
/// Cloneable so memoized failures can be handed to every caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzerError {
    /// The provider failed for this project
    #[error("Failed to hash files for project '{project}': {reason}")]
    ProviderFailed { project: String, reason: String },

    /// The provider failed for the shared files
    #[error("Failed to hash shared files: {0}")]
    SharedFiles(String),

    /// Project is not known to the analyzer
    #[error("Unknown project '{0}'")]
    UnknownProject(String),
}

/// Derived state of one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    /// Project name
    pub project: String,
    /// Tracked files including shared files
    pub files: FileHashes,
    /// Hash over all tracked files
    pub hash: String,
}

impl ProjectState {
    fn new(project: impl Into<String>, files: FileHashes) -> Self {
        let hash = ContentHasher::hash_entries(&files);
        Self {
            project: project.into(),
            files,
            hash,
        }
    }
}

type StateCell = Arc<OnceLock<Result<Arc<ProjectState>, AnalyzerError>>>;

/// Computes per-project state hashes from a file-hash snapshot
pub struct ProjectChangeAnalyzer {
    provider: Arc<dyn FileHashProvider>,
    projects: BTreeMap<String, Project>,
    shared_files: Vec<PathBuf>,
    shared: OnceLock<Result<FileHashes, AnalyzerError>>,
    states: Mutex<HashMap<String, StateCell>>,
}

impl ProjectChangeAnalyzer {
    /// Create an analyzer for one build run
    pub fn new(
        provider: Arc<dyn FileHashProvider>,
        projects: &[Project],
        shared_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            provider,
            projects: projects
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            shared_files,
            shared: OnceLock::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// State of one project, computed at most once per analyzer
    pub fn project_state(&self, name: &str) -> Result<Arc<ProjectState>, AnalyzerError> {
        let cell = {
            let mut states = self
                .states
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            states.entry(name.to_string()).or_default().clone()
        };
        cell.get_or_init(|| self.compute_state(name)).clone()
    }

    /// State hash of one project
    pub fn state_hash(&self, name: &str) -> Result<String, AnalyzerError> {
        self.project_state(name).map(|s| s.hash.clone())
    }

    /// State hashes of every known project
    pub fn state_hashes(&self) -> Result<BTreeMap<String, String>, AnalyzerError> {
        self.projects
            .keys()
            .map(|name| Ok((name.clone(), self.state_hash(name)?)))
            .collect()
    }

    /// Projects whose state differs from a previously recorded set of hashes.
    ///
    /// Projects absent from `previous` count as changed.
    #[instrument(skip_all, fields(previous = previous.len()))]
    pub fn changed_projects(
        &self,
        previous: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, AnalyzerError> {
        let mut changed = Vec::new();
        for name in self.projects.keys() {
            let hash = self.state_hash(name)?;
            if previous.get(name) != Some(&hash) {
                changed.push(name.clone());
            }
        }
        info!(changed = changed.len(), "change analysis complete");
        Ok(changed)
    }

    fn shared_hashes(&self) -> Result<FileHashes, AnalyzerError> {
        self.shared
            .get_or_init(|| {
                if self.shared_files.is_empty() {
                    return Ok(FileHashes::new());
                }
                self.provider
                    .hash_files(&self.shared_files)
                    .map_err(|e| AnalyzerError::SharedFiles(e.to_string()))
            })
            .clone()
    }

    fn compute_state(&self, name: &str) -> Result<Arc<ProjectState>, AnalyzerError> {
        let project = self
            .projects
            .get(name)
            .ok_or_else(|| AnalyzerError::UnknownProject(name.to_string()))?;

        let mut files = self.provider.hash_folder(&project.folder).map_err(|e| {
            warn!(project = name, error = %e, "file hash provider failed");
            AnalyzerError::ProviderFailed {
                project: name.to_string(),
                reason: e.to_string(),
            }
        })?;

        // Files of nested projects belong to the nested project only.
        let own = normalize_folder(&project.folder);
        for other in self.projects.values().filter(|p| p.name != project.name) {
            let nested = normalize_folder(&other.folder);
            if is_nested(&own, &nested) {
                let prefix = format!("{}/", nested);
                files.retain(|path, _| !path.starts_with(&prefix));
            }
        }

        files.extend(self.shared_hashes()?);

        let state = ProjectState::new(name, files);
        debug!(
            project = name,
            files = state.files.len(),
            hash = %state.hash,
            "project state computed"
        );
        Ok(Arc::new(state))
    }
}

/// Folder as a `/`-separated relative path; the workspace root is `""`
fn normalize_folder(folder: &Path) -> String {
    folder
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_nested(outer: &str, inner: &str) -> bool {
    if inner.is_empty() || inner == outer {
        return false;
    }
    outer.is_empty() || inner.starts_with(&format!("{}/", outer))
}

/// Hash provider reading files straight from the working tree.
///
/// Files matched by `.gitignore` rules or by the configured ignore globs are
/// not part of any project state.
pub struct FsHashProvider {
    root: PathBuf,
    ignore: GlobSet,
}

impl FsHashProvider {
    /// Create a provider rooted at the workspace root
    pub fn new(root: impl Into<PathBuf>, ignore: &[String]) -> Result<Self, HashProviderError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            root: root.into(),
            ignore: builder.build()?,
        })
    }

    fn relative(&self, path: &Path) -> String {
        normalize_folder(path.strip_prefix(&self.root).unwrap_or(path))
    }

    fn hash_file(&self, path: &Path) -> Result<String, HashProviderError> {
        let contents = std::fs::read(path).map_err(|source| HashProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ContentHasher::hash_bytes(&contents))
    }
}

impl FileHashProvider for FsHashProvider {
    fn hash_folder(&self, folder: &Path) -> Result<FileHashes, HashProviderError> {
        let dir = self.root.join(folder);
        if !dir.is_dir() {
            return Err(HashProviderError::MissingFolder(dir));
        }

        // Honors .gitignore and .ignore files in the folder and its parents
        let walker = WalkBuilder::new(&dir)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .filter_entry(|entry| entry.file_name() != ".git")
            .build();

        let mut hashes = FileHashes::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let relative = self.relative(entry.path());
            if self.ignore.is_match(&relative) {
                continue;
            }
            hashes.insert(relative, self.hash_file(entry.path())?);
        }
        Ok(hashes)
    }

    fn hash_files(&self, paths: &[PathBuf]) -> Result<FileHashes, HashProviderError> {
        let mut hashes = FileHashes::new();
        for path in paths {
            let full = self.root.join(path);
            if !full.is_file() {
                return Err(HashProviderError::MissingFile(full));
            }
            hashes.insert(normalize_folder(path), self.hash_file(&full)?);
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Provider backed by a fixed file list
    #[derive(Default)]
    struct StaticProvider {
        files: FileHashes,
        failing: Vec<PathBuf>,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn with(mut self, path: &str, hash: &str) -> Self {
            self.files.insert(path.to_string(), hash.to_string());
            self
        }
    }

    impl FileHashProvider for StaticProvider {
        fn hash_folder(&self, folder: &Path) -> Result<FileHashes, HashProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|f| f == folder) {
                return Err(HashProviderError::MissingFolder(folder.to_path_buf()));
            }
            let prefix = normalize_folder(folder);
            Ok(self
                .files
                .iter()
                .filter(|(path, _)| prefix.is_empty() || path.starts_with(&format!("{}/", prefix)))
                .map(|(p, h)| (p.clone(), h.clone()))
                .collect())
        }

        fn hash_files(&self, paths: &[PathBuf]) -> Result<FileHashes, HashProviderError> {
            paths
                .iter()
                .map(|p| {
                    let key = normalize_folder(p);
                    self.files
                        .get(&key)
                        .map(|h| (key.clone(), h.clone()))
                        .ok_or(HashProviderError::MissingFile(p.clone()))
                })
                .collect()
        }
    }

    fn projects() -> Vec<Project> {
        vec![
            Project::new("core", "packages/core"),
            Project::new("app", "packages/app").with_dependency("core"),
        ]
    }

    fn provider() -> StaticProvider {
        StaticProvider::default()
            .with("packages/core/lib.rs", "c1")
            .with("packages/app/main.rs", "a1")
            .with("Cargo.lock", "lock1")
    }

    #[test]
    fn test_state_hash_is_deterministic() {
        let first = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), vec![]);
        let second = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), vec![]);

        assert_eq!(
            first.state_hash("core").unwrap(),
            second.state_hash("core").unwrap()
        );
        assert_ne!(
            first.state_hash("core").unwrap(),
            first.state_hash("app").unwrap()
        );
    }

    #[test]
    fn test_state_is_memoized() {
        let provider = Arc::new(provider());
        let analyzer = ProjectChangeAnalyzer::new(provider.clone(), &projects(), vec![]);

        let a = analyzer.project_state("core").unwrap();
        let b = analyzer.project_state("core").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_change_only_affects_owner() {
        let before = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), vec![]);
        let after = ProjectChangeAnalyzer::new(
            Arc::new(provider().with("packages/core/lib.rs", "c2")),
            &projects(),
            vec![],
        );

        assert_ne!(
            before.state_hash("core").unwrap(),
            after.state_hash("core").unwrap()
        );
        assert_eq!(
            before.state_hash("app").unwrap(),
            after.state_hash("app").unwrap()
        );
    }

    #[test]
    fn test_shared_files_affect_every_project() {
        let shared = vec![PathBuf::from("Cargo.lock")];
        let before = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), shared.clone());
        let after = ProjectChangeAnalyzer::new(
            Arc::new(provider().with("Cargo.lock", "lock2")),
            &projects(),
            shared,
        );

        for name in ["core", "app"] {
            assert_ne!(before.state_hash(name).unwrap(), after.state_hash(name).unwrap());
        }
        assert!(before
            .project_state("core")
            .unwrap()
            .files
            .contains_key("Cargo.lock"));
    }

    #[test]
    fn test_provider_failure_propagates() {
        let provider = StaticProvider {
            failing: vec![PathBuf::from("packages/core")],
            ..provider()
        };
        let analyzer = ProjectChangeAnalyzer::new(Arc::new(provider), &projects(), vec![]);

        let err = analyzer.project_state("core").unwrap_err();
        assert!(matches!(err, AnalyzerError::ProviderFailed { ref project, .. } if project == "core"));
        assert!(analyzer.project_state("app").is_ok());
    }

    #[test]
    fn test_missing_shared_file_propagates() {
        let analyzer = ProjectChangeAnalyzer::new(
            Arc::new(provider()),
            &projects(),
            vec![PathBuf::from("pnpm-lock.yaml")],
        );
        assert!(matches!(
            analyzer.state_hash("core"),
            Err(AnalyzerError::SharedFiles(_))
        ));
    }

    #[test]
    fn test_unknown_project() {
        let analyzer = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), vec![]);
        assert_eq!(
            analyzer.state_hash("ghost"),
            Err(AnalyzerError::UnknownProject("ghost".to_string()))
        );
    }

    #[test]
    fn test_nested_project_files_excluded_from_parent() {
        let projects = vec![
            Project::new("root", "."),
            Project::new("tool", "tools/gen"),
        ];
        let provider = StaticProvider::default()
            .with("README.md", "r1")
            .with("tools/gen/main.rs", "g1");
        let analyzer = ProjectChangeAnalyzer::new(Arc::new(provider), &projects, vec![]);

        let root = analyzer.project_state("root").unwrap();
        assert!(root.files.contains_key("README.md"));
        assert!(!root.files.contains_key("tools/gen/main.rs"));

        let tool = analyzer.project_state("tool").unwrap();
        assert!(tool.files.contains_key("tools/gen/main.rs"));
    }

    #[test]
    fn test_changed_projects() {
        let analyzer = ProjectChangeAnalyzer::new(Arc::new(provider()), &projects(), vec![]);
        let mut previous = analyzer.state_hashes().unwrap();
        assert!(analyzer.changed_projects(&previous).unwrap().is_empty());

        previous.insert("core".to_string(), "stale".to_string());
        previous.remove("app");
        let changed = analyzer.changed_projects(&previous).unwrap();
        assert_eq!(changed, vec!["app".to_string(), "core".to_string()]);
    }

    #[test]
    fn test_fs_provider_hashes_and_ignores() {
        let temp = TempDir::new().unwrap();
        let core = temp.path().join("packages/core");
        std::fs::create_dir_all(core.join("src")).unwrap();
        std::fs::create_dir_all(core.join("target")).unwrap();
        std::fs::write(core.join("src/lib.rs"), "pub fn a() {}").unwrap();
        std::fs::write(core.join("target/out.bin"), "junk").unwrap();
        std::fs::write(temp.path().join("Cargo.lock"), "lock").unwrap();

        let provider =
            FsHashProvider::new(temp.path(), &["**/target/**".to_string()]).unwrap();

        let hashes = provider.hash_folder(Path::new("packages/core")).unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(
            hashes["packages/core/src/lib.rs"],
            ContentHasher::hash_bytes("pub fn a() {}")
        );

        let shared = provider.hash_files(&[PathBuf::from("Cargo.lock")]).unwrap();
        assert!(shared.contains_key("Cargo.lock"));
    }

    #[test]
    fn test_fs_provider_honors_gitignore() {
        let temp = TempDir::new().unwrap();
        let lib = temp.path().join("lib");
        std::fs::create_dir_all(lib.join("src")).unwrap();
        std::fs::create_dir_all(lib.join("dist")).unwrap();
        std::fs::create_dir_all(temp.path().join(".git")).unwrap();
        std::fs::write(temp.path().join(".gitignore"), "dist/\n").unwrap();
        std::fs::write(temp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(lib.join(".gitignore"), "*.log\n").unwrap();
        std::fs::write(lib.join("src/index.ts"), "export {}").unwrap();
        std::fs::write(lib.join("dist/index.js"), "built").unwrap();
        std::fs::write(lib.join("build.log"), "noise").unwrap();
        std::fs::write(lib.join(".env.example"), "KEY=").unwrap();

        let provider = FsHashProvider::new(temp.path(), &[]).unwrap();

        let hashes = provider.hash_folder(Path::new("lib")).unwrap();
        let paths: Vec<&str> = hashes.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec!["lib/.env.example", "lib/.gitignore", "lib/src/index.ts"]
        );

        let root = provider.hash_folder(Path::new(".")).unwrap();
        assert!(!root.keys().any(|p| p.starts_with(".git/")));
        assert!(!root.contains_key("lib/dist/index.js"));
    }

    #[test]
    fn test_fs_provider_missing_folder_is_error() {
        let temp = TempDir::new().unwrap();
        let provider = FsHashProvider::new(temp.path(), &[]).unwrap();
        assert!(matches!(
            provider.hash_folder(Path::new("nope")),
            Err(HashProviderError::MissingFolder(_))
        ));
        assert!(matches!(
            provider.hash_files(&[PathBuf::from("nope.lock")]),
            Err(HashProviderError::MissingFile(_))
        ));
    }

    #[test]
    fn test_normalize_folder() {
        assert_eq!(normalize_folder(Path::new("./packages/core/")), "packages/core");
        assert_eq!(normalize_folder(Path::new(".")), "");
        assert!(is_nested("", "tools"));
        assert!(is_nested("packages", "packages/core"));
        assert!(!is_nested("packages/co", "packages/core"));
        assert!(!is_nested("packages/core", "packages/core"));
    }
}
