//! Cache fingerprints for operations
//!
//! `fingerprint(op) = H(phase config hash, project state hash, sorted upstream fingerprints)`.
//! Upstream fingerprints are ordered by operation identity so the result does
//! not depend on edge insertion order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analyzer::{AnalyzerError, ProjectChangeAnalyzer};
use crate::graph::{OperationGraph, OperationNode};
use crate::hasher::ContentHasher;
use crate::operation::OperationId;
use crate::project::Phase;

/// Cache key of an operation: a SHA-256 hex digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// The hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint could not be derived
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// The project state, or an upstream fingerprint, is unavailable
    #[error("Fingerprint unavailable for {operation}: {reason}")]
    Unavailable { operation: OperationId, reason: String },
}

/// Source of project state hashes
pub trait StateHashSource: Send + Sync {
    /// State hash of a project
    fn state_hash(&self, project: &str) -> Result<String, AnalyzerError>;
}

impl StateHashSource for ProjectChangeAnalyzer {
    fn state_hash(&self, project: &str) -> Result<String, AnalyzerError> {
        ProjectChangeAnalyzer::state_hash(self, project)
    }
}

impl StateHashSource for BTreeMap<String, String> {
    fn state_hash(&self, project: &str) -> Result<String, AnalyzerError> {
        self.get(project)
            .cloned()
            .ok_or_else(|| AnalyzerError::UnknownProject(project.to_string()))
    }
}

/// Hash of a phase declaration
pub fn phase_config_hash(phase: &Phase) -> String {
    let mut hasher = ContentHasher::new();
    hasher.labelled("name", &phase.name);
    hasher.labelled("command", phase.command.as_deref().unwrap_or(""));
    hasher.labelled("upstream", if phase.upstream { "1" } else { "0" });
    for dep in &phase.depends_on {
        hasher.labelled("depends_on", dep);
    }
    for (key, value) in &phase.env {
        hasher.labelled("env", key).field(value);
    }
    // serde_json maps are ordered by key, so this serialization is canonical
    hasher.labelled("config", phase.config.to_string());
    hasher.finish()
}

/// Configuration component of one operation's fingerprint: the phase
/// declaration plus the command the project resolves for it
fn operation_config_hash(node: &OperationNode, phase_hash: &str) -> String {
    let mut hasher = ContentHasher::new();
    hasher.labelled("phase", phase_hash);
    hasher.labelled(
        "resolved_command",
        node.phase.command_for(&node.project).unwrap_or(""),
    );
    hasher.finish()
}

/// Memoizing fingerprint calculator for one graph and one run.
///
/// Each operation's fingerprint is computed at most once; concurrent requests
/// for the same operation block on the single in-flight computation. When the
/// graph was pruned by project selection, fingerprints are computed over its
/// dependency cone so left-out projects still contribute their state.
pub struct FingerprintBuilder {
    graph: Arc<OperationGraph>,
    keyed: Arc<OperationGraph>,
    positions: Vec<usize>,
    states: Arc<dyn StateHashSource>,
    phase_hashes: HashMap<String, String>,
    project_states: BTreeMap<String, OnceLock<Result<String, AnalyzerError>>>,
    cells: Vec<OnceLock<Result<Fingerprint, FingerprintError>>>,
}

impl FingerprintBuilder {
    /// Create a builder
    pub fn new(graph: Arc<OperationGraph>, states: Arc<dyn StateHashSource>) -> Self {
        let scope = graph.fingerprint_scope().cloned();
        let (keyed, positions) = match scope.and_then(|cone| {
            let positions: Option<Vec<usize>> =
                graph.nodes().iter().map(|n| cone.index_of(&n.id)).collect();
            positions.map(|p| (cone, p))
        }) {
            Some(scoped) => scoped,
            None => (graph.clone(), (0..graph.len()).collect()),
        };

        let mut phase_hashes = HashMap::new();
        let mut project_states = BTreeMap::new();
        for node in keyed.nodes() {
            phase_hashes
                .entry(node.phase.name.clone())
                .or_insert_with(|| phase_config_hash(&node.phase));
            project_states
                .entry(node.id.project.clone())
                .or_insert_with(OnceLock::new);
        }
        let cells = (0..keyed.len()).map(|_| OnceLock::new()).collect();

        Self {
            graph,
            keyed,
            positions,
            states,
            phase_hashes,
            project_states,
            cells,
        }
    }

    /// Read the state of every participating project now.
    ///
    /// Fingerprints computed later use this snapshot, so files written by
    /// operations of this run do not leak into keys of the same run.
    pub fn capture_states(&self) {
        for project in self.project_states.keys() {
            // Failures are memoized and reported per operation
            let _ = self.project_state(project);
        }
    }

    /// Fingerprint of the operation at `index`
    pub fn fingerprint(&self, index: usize) -> Result<Fingerprint, FingerprintError> {
        self.keyed_fingerprint(self.positions[index])
    }

    /// Fingerprints of every operation, in topological order
    pub fn compute_all(&self) -> Vec<(OperationId, Result<Fingerprint, FingerprintError>)> {
        self.graph
            .sorted()
            .iter()
            .map(|&i| (self.graph.node(i).id.clone(), self.fingerprint(i)))
            .collect()
    }

    fn keyed_fingerprint(&self, index: usize) -> Result<Fingerprint, FingerprintError> {
        self.cells[index].get_or_init(|| self.compute(index)).clone()
    }

    fn project_state(&self, project: &str) -> Result<String, AnalyzerError> {
        match self.project_states.get(project) {
            Some(cell) => cell
                .get_or_init(|| self.states.state_hash(project))
                .clone(),
            None => self.states.state_hash(project),
        }
    }

    fn compute(&self, index: usize) -> Result<Fingerprint, FingerprintError> {
        let node = self.keyed.node(index);
        let unavailable = |reason: String| FingerprintError::Unavailable {
            operation: node.id.clone(),
            reason,
        };

        let state = self.project_state(&node.id.project).map_err(|e| {
            warn!(operation = %node.id, error = %e, "project state unavailable");
            unavailable(e.to_string())
        })?;

        let mut upstream: Vec<(String, Fingerprint)> = Vec::with_capacity(node.upstream.len());
        for &u in &node.upstream {
            let id = self.keyed.node(u).id.to_string();
            let fingerprint = self
                .keyed_fingerprint(u)
                .map_err(|e| unavailable(format!("upstream {}: {}", id, e)))?;
            upstream.push((id, fingerprint));
        }
        upstream.sort();

        let phase_hash = self
            .phase_hashes
            .get(&node.phase.name)
            .cloned()
            .unwrap_or_else(|| phase_config_hash(&node.phase));

        let mut hasher = ContentHasher::new();
        hasher.labelled("config", operation_config_hash(node, &phase_hash));
        hasher.labelled("state", &state);
        hasher.field((upstream.len() as u64).to_le_bytes());
        for (id, fingerprint) in &upstream {
            hasher.labelled(id, fingerprint.as_str());
        }

        let fingerprint = Fingerprint(hasher.finish());
        debug!(operation = %node.id, %fingerprint, "fingerprint computed");
        Ok(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProjectSelection;
    use crate::project::Project;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn projects() -> Vec<Project> {
        vec![
            Project::new("core", "core"),
            Project::new("lib", "lib").with_dependency("core"),
            Project::new("app", "app").with_dependency("lib"),
            Project::new("other", "other"),
        ]
    }

    fn phases() -> Vec<Phase> {
        vec![
            Phase::new("build").with_command("make").with_upstream(true),
            Phase::new("test")
                .with_command("make test")
                .with_depends_on("build")
                .with_upstream(true),
        ]
    }

    fn graph_from(projects: &[Project], phases: &[Phase]) -> Arc<OperationGraph> {
        Arc::new(
            OperationGraph::build(
                projects,
                phases,
                &["test".to_string()],
                &ProjectSelection::All,
            )
            .unwrap(),
        )
    }

    fn states() -> BTreeMap<String, String> {
        ["core", "lib", "app", "other"]
            .iter()
            .map(|p| (p.to_string(), format!("state-{}", p)))
            .collect()
    }

    fn all(builder: &FingerprintBuilder) -> BTreeMap<String, Fingerprint> {
        builder
            .compute_all()
            .into_iter()
            .map(|(id, fp)| (id.to_string(), fp.unwrap()))
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let graph = graph_from(&projects(), &phases());
        let first = FingerprintBuilder::new(graph.clone(), Arc::new(states()));
        let second = FingerprintBuilder::new(graph, Arc::new(states()));

        assert_eq!(all(&first), all(&second));
    }

    #[test]
    fn test_independent_of_insertion_order() {
        let reversed_projects: Vec<Project> = projects().into_iter().rev().collect();
        let reversed_phases: Vec<Phase> = phases().into_iter().rev().collect();

        let a = FingerprintBuilder::new(graph_from(&projects(), &phases()), Arc::new(states()));
        let b = FingerprintBuilder::new(
            graph_from(&reversed_projects, &reversed_phases),
            Arc::new(states()),
        );

        assert_eq!(all(&a), all(&b));
    }

    #[test]
    fn test_state_change_propagates_downstream_only() {
        let graph = graph_from(&projects(), &phases());
        let before = all(&FingerprintBuilder::new(graph.clone(), Arc::new(states())));

        let mut changed = states();
        changed.insert("lib".to_string(), "state-lib-v2".to_string());
        let after = all(&FingerprintBuilder::new(graph, Arc::new(changed)));

        for id in ["lib:build", "lib:test", "app:build", "app:test"] {
            assert_ne!(before[id], after[id], "{id} should change");
        }
        for id in ["core:build", "core:test", "other:build", "other:test"] {
            assert_eq!(before[id], after[id], "{id} should not change");
        }
    }

    #[test]
    fn test_phase_config_change_changes_fingerprint() {
        let before = all(&FingerprintBuilder::new(
            graph_from(&projects(), &phases()),
            Arc::new(states()),
        ));

        let mut tweaked = phases();
        tweaked[0] = tweaked[0]
            .clone()
            .with_config(serde_json::json!({ "release": true }));
        let after = all(&FingerprintBuilder::new(
            graph_from(&projects(), &tweaked),
            Arc::new(states()),
        ));

        assert_ne!(before["core:build"], after["core:build"]);
    }

    #[test]
    fn test_command_override_changes_fingerprint() {
        let before = all(&FingerprintBuilder::new(
            graph_from(&projects(), &phases()),
            Arc::new(states()),
        ));

        let mut overridden = projects();
        overridden[3] = overridden[3].clone().with_command("build", "make other");
        let after = all(&FingerprintBuilder::new(
            graph_from(&overridden, &phases()),
            Arc::new(states()),
        ));

        assert_ne!(before["other:build"], after["other:build"]);
        assert_eq!(before["core:build"], after["core:build"]);
    }

    #[test]
    fn test_unavailable_state_propagates() {
        let graph = graph_from(&projects(), &phases());
        let mut partial = states();
        partial.remove("lib");
        let builder = FingerprintBuilder::new(graph.clone(), Arc::new(partial));

        let lib = graph.index_of(&OperationId::new("lib", "build")).unwrap();
        let app = graph.index_of(&OperationId::new("app", "build")).unwrap();
        let core = graph.index_of(&OperationId::new("core", "build")).unwrap();

        assert!(matches!(
            builder.fingerprint(lib),
            Err(FingerprintError::Unavailable { .. })
        ));
        assert!(builder.fingerprint(app).is_err());
        assert!(builder.fingerprint(core).is_ok());
    }

    struct CountingSource {
        inner: BTreeMap<String, String>,
        calls: AtomicUsize,
    }

    impl StateHashSource for CountingSource {
        fn state_hash(&self, project: &str) -> Result<String, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            self.inner.state_hash(project)
        }
    }

    #[test]
    fn test_concurrent_requests_are_coalesced() {
        let graph = graph_from(&projects(), &phases());
        let source = Arc::new(CountingSource {
            inner: states(),
            calls: AtomicUsize::new(0),
        });
        let builder = FingerprintBuilder::new(graph.clone(), source.clone());
        let app_test = graph.index_of(&OperationId::new("app", "test")).unwrap();

        let results: Vec<Fingerprint> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| builder.fingerprint(app_test).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.windows(2).all(|w| w[0] == w[1]));
        // app:test pulls in the app, lib and core projects, each read once
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    fn only_app() -> Arc<OperationGraph> {
        Arc::new(
            OperationGraph::build(
                &projects(),
                &phases(),
                &["build".to_string()],
                &ProjectSelection::Only(vec!["app".to_string()]),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_pruned_dependency_state_still_counts() {
        let graph = only_app();
        assert_eq!(graph.len(), 1);
        let app = graph.index_of(&OperationId::new("app", "build")).unwrap();

        let before = FingerprintBuilder::new(graph.clone(), Arc::new(states()))
            .fingerprint(app)
            .unwrap();
        let mut changed = states();
        changed.insert("lib".to_string(), "state-lib-v2".to_string());
        let after = FingerprintBuilder::new(graph, Arc::new(changed))
            .fingerprint(app)
            .unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_pruned_selection_shares_keys_with_full_run() {
        let full = Arc::new(
            OperationGraph::build(
                &projects(),
                &phases(),
                &["build".to_string()],
                &ProjectSelection::All,
            )
            .unwrap(),
        );
        let id = OperationId::new("app", "build");
        let full_fp = FingerprintBuilder::new(full.clone(), Arc::new(states()))
            .fingerprint(full.index_of(&id).unwrap())
            .unwrap();

        let pruned = only_app();
        let builder = FingerprintBuilder::new(pruned.clone(), Arc::new(states()));
        let computed = builder.compute_all();

        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].0, id);
        assert_eq!(computed[0].1.as_ref().unwrap(), &full_fp);
    }

    /// Source whose answers change after the first read of each project
    struct DriftingSource {
        reads: Mutex<HashMap<String, usize>>,
    }

    impl StateHashSource for DriftingSource {
        fn state_hash(&self, project: &str) -> Result<String, AnalyzerError> {
            let mut reads = self.reads.lock().unwrap();
            let count = reads.entry(project.to_string()).or_default();
            *count += 1;
            Ok(format!("{}-{}", project, count))
        }
    }

    #[test]
    fn test_captured_states_are_used_for_every_fingerprint() {
        let graph = graph_from(&projects(), &phases());
        let source = Arc::new(DriftingSource {
            reads: Mutex::default(),
        });
        let builder = FingerprintBuilder::new(graph, source.clone());
        builder.capture_states();
        assert_eq!(source.reads.lock().unwrap().len(), 4);

        let first = all(&builder);
        assert_eq!(first, all(&builder));

        let reads = source.reads.lock().unwrap().clone();
        assert_eq!(reads.len(), 4);
        assert!(reads.values().all(|&n| n == 1));
    }
}
