//! Operation graph construction and validation
//!
//! Operations live in an arena and refer to each other by index, which keeps
//! the graph trivially shareable across tasks and serializable for snapshots.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::operation::OperationId;
use crate::project::{Phase, Project};

/// Which projects take part in a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProjectSelection {
    /// Every declared project
    #[default]
    All,
    /// Exactly the named projects
    Only(Vec<String>),
    /// The named projects and everything they transitively depend on
    To(Vec<String>),
}

/// A node in the operation graph
#[derive(Debug, Clone)]
pub struct OperationNode {
    /// Operation identifier
    pub id: OperationId,
    /// Owning project
    pub project: Arc<Project>,
    /// Phase being run
    pub phase: Arc<Phase>,
    /// Direct predecessors (sorted, no duplicates)
    pub upstream: Vec<usize>,
    /// Direct successors (sorted, no duplicates)
    pub downstream: Vec<usize>,
    /// Number of direct predecessors; the initial readiness counter
    pub in_degree: usize,
    /// Length of the longest upstream chain
    pub depth: usize,
    /// Number of transitive downstream operations
    pub criticality: usize,
}

/// Directed acyclic graph of operations
#[derive(Debug, Clone)]
pub struct OperationGraph {
    nodes: Vec<OperationNode>,
    index: HashMap<OperationId, usize>,
    sorted_order: Vec<usize>,
    /// Graph over the full dependency cone, kept when the selection pruned
    /// dependency projects out of execution
    cone: Option<Arc<OperationGraph>>,
}

impl OperationGraph {
    /// Build the operation graph.
    ///
    /// `requested` phases are expanded with their same-project phase
    /// dependencies, so asking for `test` also schedules `build` when `test`
    /// depends on it. Every selected project contributes one operation per
    /// expanded phase it participates in.
    #[instrument(skip_all, fields(projects = projects.len(), phases = phases.len(), requested = requested.len()))]
    pub fn build(
        projects: &[Project],
        phases: &[Phase],
        requested: &[String],
        selection: &ProjectSelection,
    ) -> Result<Self, GraphError> {
        validate_declarations(projects, phases)?;

        let mut graph = Self::assemble(projects, phases, requested, selection)?;

        // Pruned dependencies still decide whether cached results are valid
        if let ProjectSelection::Only(names) = selection {
            let cone = Self::assemble(
                projects,
                phases,
                requested,
                &ProjectSelection::To(names.clone()),
            )?;
            if cone.len() > graph.len() {
                debug!(
                    operations = graph.len(),
                    cone = cone.len(),
                    "keeping dependency cone of pruned selection"
                );
                graph.cone = Some(Arc::new(cone));
            }
        }

        Ok(graph)
    }

    fn assemble(
        projects: &[Project],
        phases: &[Phase],
        requested: &[String],
        selection: &ProjectSelection,
    ) -> Result<Self, GraphError> {
        let phase_by_name: HashMap<&str, Arc<Phase>> = phases
            .iter()
            .map(|p| (p.name.as_str(), Arc::new(p.clone())))
            .collect();
        let project_by_name: HashMap<&str, &Project> =
            projects.iter().map(|p| (p.name.as_str(), p)).collect();

        let phase_names = expand_phases(phases, &phase_by_name, requested)?;
        let selected = select_projects(projects, &project_by_name, selection)?;

        // Create one node per project x phase
        let mut nodes: Vec<OperationNode> = Vec::new();
        let mut index: HashMap<OperationId, usize> = HashMap::new();

        for project in projects.iter().filter(|p| selected.contains(p.name.as_str())) {
            let project_arc = Arc::new(project.clone());
            for phase in phases.iter().filter(|p| phase_names.contains(p.name.as_str())) {
                if !project.selects(&phase.name) {
                    continue;
                }
                let id = OperationId::new(&project.name, &phase.name);
                index.insert(id.clone(), nodes.len());
                nodes.push(OperationNode {
                    id,
                    project: project_arc.clone(),
                    phase: phase_by_name[phase.name.as_str()].clone(),
                    upstream: Vec::new(),
                    downstream: Vec::new(),
                    in_degree: 0,
                    depth: 0,
                    criticality: 0,
                });
            }
        }

        // Wire up edges
        let mut upstream_sets: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            // Same-project phase ordering (e.g., test depends_on build)
            for dep_phase in &node.phase.depends_on {
                if let Some(&j) = index.get(&OperationId::new(&node.id.project, dep_phase)) {
                    upstream_sets[i].insert(j);
                }
            }

            // Same phase in dependency projects; missing operations are elided
            if node.phase.upstream {
                for dep_project in node.project.ordering_dependencies() {
                    if let Some(&j) = index.get(&OperationId::new(dep_project, &node.id.phase)) {
                        upstream_sets[i].insert(j);
                    }
                }
            }
        }

        for (i, upstream) in upstream_sets.into_iter().enumerate() {
            for &j in &upstream {
                nodes[j].downstream.push(i);
            }
            nodes[i].in_degree = upstream.len();
            nodes[i].upstream = upstream.into_iter().collect();
        }
        for node in &mut nodes {
            node.downstream.sort_unstable();
            node.downstream.dedup();
        }

        if let Some(cycle) = find_cycle(&nodes) {
            let path: Vec<OperationId> = cycle.iter().map(|&i| nodes[i].id.clone()).collect();
            return Err(GraphError::Cycle { path });
        }

        let sorted_order = topological_sort(&nodes);

        for &i in &sorted_order {
            let depth = nodes[i]
                .upstream
                .iter()
                .map(|&u| nodes[u].depth + 1)
                .max()
                .unwrap_or(0);
            nodes[i].depth = depth;
        }

        let criticality = compute_criticality(&nodes);
        for (node, value) in nodes.iter_mut().zip(criticality) {
            node.criticality = value;
        }

        info!(
            operation_count = nodes.len(),
            edge_count = nodes.iter().map(|n| n.upstream.len()).sum::<usize>(),
            "operation graph built"
        );

        Ok(Self {
            nodes,
            index,
            sorted_order,
            cone: None,
        })
    }

    /// Larger graph to compute cache fingerprints over, present when the
    /// project selection left out projects that selected operations depend on
    pub fn fingerprint_scope(&self) -> Option<&Arc<OperationGraph>> {
        self.cone.as_ref()
    }

    /// Get all operation nodes, indexed by arena position
    pub fn nodes(&self) -> &[OperationNode] {
        &self.nodes
    }

    /// Get a node by arena index
    pub fn node(&self, index: usize) -> &OperationNode {
        &self.nodes[index]
    }

    /// Get a node by operation ID
    pub fn get(&self, id: &OperationId) -> Option<&OperationNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// Arena index of an operation
    pub fn index_of(&self, id: &OperationId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Get the total number of operations
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Arena indices in topological order (upstream first)
    pub fn sorted(&self) -> &[usize] {
        &self.sorted_order
    }

    /// Operation IDs in topological order
    pub fn sorted_ids(&self) -> Vec<&OperationId> {
        self.sorted_order.iter().map(|&i| &self.nodes[i].id).collect()
    }

    /// All transitive downstream operations of a node
    pub fn downstream_closure(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = self.nodes[index].downstream.iter().copied().collect();
        let mut result = Vec::new();

        while let Some(i) = queue.pop_front() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            result.push(i);
            queue.extend(self.nodes[i].downstream.iter().copied());
        }

        result
    }

    /// Topology snapshot for cross-process coordination
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            operations: self
                .nodes
                .iter()
                .map(|n| SnapshotOperation {
                    id: n.id.to_string(),
                    project: n.id.project.clone(),
                    phase: n.id.phase.clone(),
                    upstream: n.upstream.clone(),
                })
                .collect(),
        }
    }

    /// Get a human-readable summary of the execution plan, grouped by depth
    pub fn execution_plan(&self) -> String {
        let max_depth = self.nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let mut plan = String::new();

        for depth in 0..=max_depth {
            let level: Vec<&OperationNode> = self
                .sorted_order
                .iter()
                .map(|&i| &self.nodes[i])
                .filter(|n| n.depth == depth)
                .collect();
            if level.is_empty() {
                continue;
            }

            plan.push_str(&format!("Depth {} ({} operations):\n", depth, level.len()));
            for node in level {
                let cmd = node
                    .phase
                    .command_for(&node.project)
                    .unwrap_or("<no-op>");
                let deps: Vec<String> = node
                    .upstream
                    .iter()
                    .map(|&u| self.nodes[u].id.to_string())
                    .collect();
                if deps.is_empty() {
                    plan.push_str(&format!("  {} -> {}\n", node.id, cmd));
                } else {
                    plan.push_str(&format!(
                        "  {} -> {} (after: {})\n",
                        node.id,
                        cmd,
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }
}

/// Serializable graph topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Operations in arena order; `upstream` refers to positions in this list
    pub operations: Vec<SnapshotOperation>,
}

/// One operation in a [`GraphSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOperation {
    pub id: String,
    pub project: String,
    pub phase: String,
    pub upstream: Vec<usize>,
}

/// Kind of a declared name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Project,
    Phase,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Phase => write!(f, "phase"),
        }
    }
}

/// Errors during graph construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Dependency cycle among operations
    #[error("Dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<OperationId> },

    /// A declaration references a name that does not exist
    #[error("Unknown {kind} '{name}' referenced by {referrer}")]
    UnknownReference {
        kind: ReferenceKind,
        name: String,
        referrer: String,
    },

    /// A phase lists itself as a same-project dependency
    #[error("Phase '{0}' depends on itself")]
    SelfDependency(String),

    /// A project depends on itself
    #[error("Project '{0}' depends on itself")]
    SelfProjectDependency(String),

    /// The same name is declared twice
    #[error("Duplicate {kind} declaration '{name}'")]
    Duplicate { kind: ReferenceKind, name: String },
}

fn format_path(path: &[OperationId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Check declarations for self references, duplicates and unknown names
fn validate_declarations(projects: &[Project], phases: &[Phase]) -> Result<(), GraphError> {
    let mut phase_names = HashSet::new();
    for phase in phases {
        if !phase_names.insert(phase.name.as_str()) {
            return Err(GraphError::Duplicate {
                kind: ReferenceKind::Phase,
                name: phase.name.clone(),
            });
        }
    }

    let mut project_names = HashSet::new();
    for project in projects {
        if !project_names.insert(project.name.as_str()) {
            return Err(GraphError::Duplicate {
                kind: ReferenceKind::Project,
                name: project.name.clone(),
            });
        }
    }

    for phase in phases {
        if phase.depends_on.contains(&phase.name) {
            return Err(GraphError::SelfDependency(phase.name.clone()));
        }
        if let Some(dep) = phase
            .depends_on
            .iter()
            .find(|d| !phase_names.contains(d.as_str()))
        {
            return Err(GraphError::UnknownReference {
                kind: ReferenceKind::Phase,
                name: dep.clone(),
                referrer: format!("phase '{}'", phase.name),
            });
        }
    }

    for project in projects {
        if project.dependencies.contains(&project.name) {
            return Err(GraphError::SelfProjectDependency(project.name.clone()));
        }
        let referrer = || format!("project '{}'", project.name);

        for dep in project.dependencies.iter().chain(&project.cyclic_dependencies) {
            if !project_names.contains(dep.as_str()) {
                return Err(GraphError::UnknownReference {
                    kind: ReferenceKind::Project,
                    name: dep.clone(),
                    referrer: referrer(),
                });
            }
        }
        for phase in project.phases.iter().chain(project.commands.keys()) {
            if !phase_names.contains(phase.as_str()) {
                return Err(GraphError::UnknownReference {
                    kind: ReferenceKind::Phase,
                    name: phase.clone(),
                    referrer: referrer(),
                });
            }
        }
    }

    debug!("declarations validated");
    Ok(())
}

/// Requested phases plus their same-project phase dependencies
fn expand_phases<'a>(
    phases: &'a [Phase],
    phase_by_name: &HashMap<&str, Arc<Phase>>,
    requested: &[String],
) -> Result<HashSet<&'a str>, GraphError> {
    let mut expanded: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    for name in requested {
        match phases.iter().find(|p| &p.name == name) {
            Some(phase) => queue.push_back(phase.name.as_str()),
            None => {
                return Err(GraphError::UnknownReference {
                    kind: ReferenceKind::Phase,
                    name: name.clone(),
                    referrer: "the phase selection".to_string(),
                })
            }
        }
    }

    while let Some(name) = queue.pop_front() {
        if !expanded.insert(name) {
            continue;
        }
        if let Some(phase) = phase_by_name.get(name) {
            for dep in &phase.depends_on {
                if let Some(decl) = phases.iter().find(|p| &p.name == dep) {
                    queue.push_back(decl.name.as_str());
                }
            }
        }
    }

    Ok(expanded)
}

/// Resolve the project selection to a set of project names
fn select_projects<'a>(
    projects: &'a [Project],
    project_by_name: &HashMap<&str, &'a Project>,
    selection: &ProjectSelection,
) -> Result<HashSet<&'a str>, GraphError> {
    let lookup = |name: &String| {
        project_by_name
            .get(name.as_str())
            .copied()
            .ok_or_else(|| GraphError::UnknownReference {
                kind: ReferenceKind::Project,
                name: name.clone(),
                referrer: "the project selection".to_string(),
            })
    };

    match selection {
        ProjectSelection::All => Ok(projects.iter().map(|p| p.name.as_str()).collect()),
        ProjectSelection::Only(names) => names
            .iter()
            .map(|n| lookup(n).map(|p| p.name.as_str()))
            .collect(),
        ProjectSelection::To(names) => {
            let mut selected = HashSet::new();
            let mut queue = VecDeque::new();
            for name in names {
                queue.push_back(lookup(name)?);
            }
            while let Some(project) = queue.pop_front() {
                if !selected.insert(project.name.as_str()) {
                    continue;
                }
                for dep in &project.dependencies {
                    if let Some(&dep_project) = project_by_name.get(dep.as_str()) {
                        queue.push_back(dep_project);
                    }
                }
            }
            Ok(selected)
        }
    }
}

/// Depth-first search for a cycle along downstream edges.
///
/// Returns the cycle as a closed path (first element repeated at the end).
fn find_cycle(nodes: &[OperationNode]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..nodes.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // Iterative DFS: each frame is (node, next downstream position)
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;
        stack.push(start);

        while let Some(frame) = frames.last_mut() {
            let (current, next) = *frame;
            if let Some(&child) = nodes[current].downstream.get(next) {
                frame.1 += 1;
                match marks[child] {
                    Mark::InProgress => {
                        let pos = stack.iter().position(|&n| n == child).unwrap_or(0);
                        let mut cycle = stack[pos..].to_vec();
                        cycle.push(child);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[child] = Mark::InProgress;
                        stack.push(child);
                        frames.push((child, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[current] = Mark::Done;
                stack.pop();
                frames.pop();
            }
        }
    }

    None
}

/// Topological sort using Kahn's algorithm; assumes the graph is acyclic
fn topological_sort(nodes: &[OperationNode]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.in_degree).collect();
    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(i) = queue.pop_front() {
        sorted.push(i);
        for &d in &nodes[i].downstream {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    sorted
}

/// Count of transitive downstream operations per node
fn compute_criticality(nodes: &[OperationNode]) -> Vec<usize> {
    let mut result = vec![0; nodes.len()];
    let mut seen = vec![usize::MAX; nodes.len()];

    for (start, value) in result.iter_mut().enumerate() {
        let mut queue: VecDeque<usize> = nodes[start].downstream.iter().copied().collect();
        let mut count = 0;
        while let Some(i) = queue.pop_front() {
            if seen[i] == start {
                continue;
            }
            seen[i] = start;
            count += 1;
            queue.extend(nodes[i].downstream.iter().copied());
        }
        *value = count;
    }

    result
}
