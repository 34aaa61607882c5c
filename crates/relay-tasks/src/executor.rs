//! Operation executor - saturating scheduler using tokio
//!
//! A single loop owns all mutable run state. Operations run in spawned tasks
//! and report back over a channel; the loop applies each completion, unlocks
//! or blocks downstream operations, and refills free slots from a ready queue
//! ordered by criticality (number of transitive dependents), then by operation
//! id.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::fingerprint::{Fingerprint, FingerprintBuilder, StateHashSource};
use crate::graph::OperationGraph;
use crate::hooks::HookRegistry;
use crate::operation::{OperationId, OperationStatus};
use crate::reporter::{BuildEvent, ResultSink, TracingSink};
use crate::runner::{Runner, RunnerContext, RunnerStatus};

/// Options for the executor
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrently executing operations
    pub concurrency: usize,
    /// Skip everything not yet dispatched after the first failure
    pub abort_on_failure: bool,
    /// Workspace root
    pub root_dir: PathBuf,
    /// Emit a graph snapshot event before running
    pub emit_snapshot: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            abort_on_failure: false,
            root_dir: std::env::current_dir().unwrap_or_default(),
            emit_snapshot: false,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Aggregated result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildOutcome {
    Success,
    Failure,
    Cancelled,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation was not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "by")]
pub enum SkipReason {
    /// An upstream operation failed
    Blocked(OperationId),
    /// Abort-on-failure stopped the run
    Aborted,
    /// The run was cancelled
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(by) => write!(f, "blocked by {}", by),
            Self::Aborted => f.write_str("aborted after an earlier failure"),
            Self::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// Final state of one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub status: OperationStatus,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Runner failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal problems, e.g. no fingerprint could be derived
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
    #[serde(skip)]
    pub log: String,
}

impl OperationRecord {
    fn new(id: OperationId) -> Self {
        Self {
            id,
            status: OperationStatus::Ready,
            duration: Duration::ZERO,
            fingerprint: None,
            skip_reason: None,
            error: None,
            advisories: Vec::new(),
            log: String::new(),
        }
    }
}

/// Outcome plus every operation's final state, in topological order
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    pub operations: Vec<OperationRecord>,
    pub duration: Duration,
}

impl BuildResult {
    /// Look up one operation
    pub fn record(&self, id: &OperationId) -> Option<&OperationRecord> {
        self.operations.iter().find(|r| &r.id == id)
    }

    /// Status of one operation
    pub fn status(&self, id: &OperationId) -> Option<OperationStatus> {
        self.record(id).map(|r| r.status)
    }

    /// Number of operations that ended with `status`
    pub fn count(&self, status: OperationStatus) -> usize {
        self.operations.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == BuildOutcome::Success
    }
}

/// Executes an operation graph with bounded parallelism
pub struct OperationExecutor {
    options: ExecutorOptions,
    runner: Arc<dyn Runner>,
    cache: Option<(Arc<dyn CacheStore>, Arc<dyn StateHashSource>)>,
    hooks: HookRegistry,
    sink: Arc<dyn ResultSink>,
}

impl OperationExecutor {
    /// Create an executor without a cache, reporting to tracing
    pub fn new(options: ExecutorOptions, runner: Arc<dyn Runner>) -> Self {
        Self {
            options,
            runner,
            cache: None,
            hooks: HookRegistry::default(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Enable cache lookups; `states` supplies project state hashes
    pub fn with_cache(
        mut self,
        store: Arc<dyn CacheStore>,
        states: Arc<dyn StateHashSource>,
    ) -> Self {
        self.cache = Some((store, states));
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run every operation in the graph to a terminal status.
    ///
    /// Cancelling `cancel` stops dispatch; operations already executing are
    /// allowed to finish and the outcome is [`BuildOutcome::Cancelled`].
    #[instrument(skip_all, fields(operations = graph.len()))]
    pub async fn run(&self, graph: Arc<OperationGraph>, cancel: CancellationToken) -> BuildResult {
        let start = Instant::now();
        let concurrency = self.options.concurrency.max(1);
        info!(concurrency, "starting build");

        if self.options.emit_snapshot {
            self.sink.report(&BuildEvent::GraphSnapshot(graph.snapshot()));
        }

        let cache = match &self.cache {
            Some((store, states)) => {
                let fingerprints = Arc::new(FingerprintBuilder::new(graph.clone(), states.clone()));

                // Project states are read before anything runs
                let capture = fingerprints.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || capture.capture_states()).await {
                    warn!(error = %e, "failed to capture project states");
                }

                Some(CacheAccess {
                    store: store.clone(),
                    fingerprints,
                })
            }
            None => None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut state = RunState::new(&graph, &*self.sink);
        let mut in_flight = 0usize;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
            }

            while !cancelled && !state.aborting && in_flight < concurrency {
                let Some(index) = state.pop_ready() else {
                    break;
                };
                let node = graph.node(index);
                let ctx = RunnerContext {
                    id: node.id.clone(),
                    project: node.project.clone(),
                    phase: node.phase.clone(),
                    root_dir: self.options.root_dir.clone(),
                    fingerprint: None,
                };

                // No work resolves in place without taking a slot
                if !self.runner.has_work(&ctx) {
                    debug!(operation = %ctx.id, "no work, resolving as no-op");
                    state.apply(Completion::new(index, OperationStatus::NoOp), self.options.abort_on_failure);
                    continue;
                }

                state.mark_executing(index, ctx.command());
                in_flight += 1;

                let job = Job {
                    index,
                    ctx,
                    runner: self.runner.clone(),
                    cache: cache.clone(),
                    hooks: self.hooks.clone(),
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let ctx = job.ctx.clone();
                    let hooks = job.hooks.clone();
                    let completion = match tokio::spawn(job.execute()).await {
                        Ok(completion) => completion,
                        Err(e) => {
                            warn!(operation = %ctx.id, error = %e, "operation task panicked");
                            let message = format!("Runner panicked: {}", e);
                            // The completion must be sent even if a hook panics again
                            let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                hooks.on_failure(&ctx, &message)
                            }));
                            if notified.is_err() {
                                warn!(operation = %ctx.id, "failure hook panicked");
                            }
                            Completion::failed(index, message)
                        }
                    };
                    let _ = tx.send(completion);
                });
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(completion) = rx.recv() => {
                    in_flight -= 1;
                    state.apply(completion, self.options.abort_on_failure);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    info!(in_flight, "cancellation requested, waiting for running operations");
                    cancelled = true;
                }
            }
        }

        let skip_reason = if cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::Aborted
        };
        state.skip_remaining(skip_reason);

        let outcome = if cancelled {
            BuildOutcome::Cancelled
        } else if state.failed {
            BuildOutcome::Failure
        } else {
            BuildOutcome::Success
        };

        let duration = start.elapsed();
        let operations: Vec<OperationRecord> = state.into_records();
        let count = |pred: fn(&OperationStatus) -> bool| {
            operations.iter().filter(|r| pred(&r.status)).count()
        };
        self.sink.report(&BuildEvent::RunFinished {
            outcome,
            total: operations.len(),
            succeeded: count(OperationStatus::is_success),
            failed: count(|s| *s == OperationStatus::Failure),
            skipped: count(|s| *s == OperationStatus::Skipped),
            from_cache: count(|s| *s == OperationStatus::FromCache),
            duration,
        });

        BuildResult {
            outcome,
            operations,
            duration,
        }
    }
}

#[derive(Clone)]
struct CacheAccess {
    store: Arc<dyn CacheStore>,
    fingerprints: Arc<FingerprintBuilder>,
}

/// Result of one operation, posted back to the scheduler loop
#[derive(Debug)]
struct Completion {
    index: usize,
    status: OperationStatus,
    duration: Duration,
    log: String,
    error: Option<String>,
    fingerprint: Option<Fingerprint>,
    advisories: Vec<String>,
}

impl Completion {
    fn new(index: usize, status: OperationStatus) -> Self {
        Self {
            index,
            status,
            duration: Duration::ZERO,
            log: String::new(),
            error: None,
            fingerprint: None,
            advisories: Vec::new(),
        }
    }

    fn failed(index: usize, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(index, OperationStatus::Failure)
        }
    }
}

/// Work shipped to a spawned task
struct Job {
    index: usize,
    ctx: RunnerContext,
    runner: Arc<dyn Runner>,
    cache: Option<CacheAccess>,
    hooks: HookRegistry,
}

impl Job {
    async fn execute(mut self) -> Completion {
        let start = Instant::now();
        let mut advisories = Vec::new();

        if let Some(cache) = &self.cache {
            let builder = cache.fingerprints.clone();
            let index = self.index;
            match tokio::task::spawn_blocking(move || builder.fingerprint(index)).await {
                Ok(Ok(fingerprint)) => self.ctx.fingerprint = Some(fingerprint),
                Ok(Err(e)) => advisories.push(format!("{}; running without cache", e)),
                Err(e) => advisories.push(format!("Fingerprint task failed: {}", e)),
            }

            if let Some(fingerprint) = &self.ctx.fingerprint {
                match cache.store.try_get(fingerprint, &self.ctx.id) {
                    Ok(Some(entry)) => {
                        debug!(operation = %self.ctx.id, "restored from cache");
                        return Completion {
                            log: entry.log,
                            fingerprint: Some(fingerprint.clone()),
                            duration: start.elapsed(),
                            ..Completion::new(self.index, OperationStatus::FromCache)
                        };
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(operation = %self.ctx.id, error = %e, "cache read failed, treating as miss");
                    }
                }
            }
        }

        self.hooks.before_execute(&self.ctx);
        let output = self.runner.execute(&self.ctx).await;
        self.hooks.after_execute(&self.ctx, &output);

        let (status, error) = match &output.status {
            RunnerStatus::Success => (OperationStatus::Success, None),
            RunnerStatus::SuccessWithWarnings => (OperationStatus::SuccessWithWarnings, None),
            RunnerStatus::Failure(message) => {
                self.hooks.on_failure(&self.ctx, message);
                (OperationStatus::Failure, Some(message.clone()))
            }
        };

        // Warnings are not cached so they show up again next run
        if status == OperationStatus::Success && self.ctx.phase.cacheable {
            if let (Some(cache), Some(fingerprint)) = (&self.cache, &self.ctx.fingerprint) {
                let entry = CacheEntry::new(
                    fingerprint.clone(),
                    self.ctx.id.clone(),
                    output.log.clone(),
                    output.duration,
                );
                if let Err(e) = cache.store.put(&entry) {
                    warn!(operation = %self.ctx.id, error = %e, "failed to store result in cache");
                }
            }
        }

        Completion {
            index: self.index,
            status,
            duration: output.duration,
            log: output.log,
            error,
            fingerprint: self.ctx.fingerprint,
            advisories,
        }
    }
}

/// Ready queue entry: higher criticality first, then lower operation id
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    criticality: usize,
    id: OperationId,
    index: usize,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.criticality
            .cmp(&other.criticality)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mutable per-run state, owned by the scheduler loop
struct RunState<'a> {
    graph: &'a OperationGraph,
    sink: &'a dyn ResultSink,
    records: Vec<OperationRecord>,
    /// Upstream operations not yet successfully finished
    remaining: Vec<usize>,
    ready: BinaryHeap<ReadyEntry>,
    failed: bool,
    aborting: bool,
}

impl<'a> RunState<'a> {
    fn new(graph: &'a OperationGraph, sink: &'a dyn ResultSink) -> Self {
        let mut state = Self {
            graph,
            sink,
            records: graph.nodes().iter().map(|n| OperationRecord::new(n.id.clone())).collect(),
            remaining: graph.nodes().iter().map(|n| n.in_degree).collect(),
            ready: BinaryHeap::new(),
            failed: false,
            aborting: false,
        };
        for index in 0..graph.len() {
            if state.remaining[index] == 0 {
                state.enqueue(index);
            }
        }
        state
    }

    fn enqueue(&mut self, index: usize) {
        let graph = self.graph;
        let node = graph.node(index);
        self.records[index].status = OperationStatus::Queued;
        self.ready.push(ReadyEntry {
            criticality: node.criticality,
            id: node.id.clone(),
            index,
        });
    }

    fn pop_ready(&mut self) -> Option<usize> {
        self.ready.pop().map(|entry| entry.index)
    }

    fn mark_executing(&mut self, index: usize, command: Option<&str>) {
        let record = &mut self.records[index];
        record.status = OperationStatus::Executing;
        self.sink.report(&BuildEvent::OperationStarted {
            id: record.id.clone(),
            command: command.map(str::to_string),
        });
    }

    /// Record a finished operation and unlock or block its dependents
    fn apply(&mut self, completion: Completion, abort_on_failure: bool) {
        let index = completion.index;
        let record = &mut self.records[index];
        record.status = completion.status;
        record.duration = completion.duration;
        record.log = completion.log;
        record.error = completion.error;
        record.fingerprint = completion.fingerprint;
        record.advisories = completion.advisories;

        let id = record.id.clone();
        for message in &record.advisories {
            self.sink.report(&BuildEvent::Advisory {
                id: id.clone(),
                message: message.clone(),
            });
        }
        self.sink.report(&BuildEvent::OperationFinished {
            id: id.clone(),
            status: completion.status,
            duration: completion.duration,
            from_cache: completion.status == OperationStatus::FromCache,
        });

        let graph = self.graph;
        if completion.status.is_success() {
            for &d in &graph.node(index).downstream {
                self.remaining[d] -= 1;
                if self.remaining[d] == 0 && self.records[d].status == OperationStatus::Ready {
                    self.enqueue(d);
                }
            }
            return;
        }

        self.failed = true;
        if abort_on_failure && !self.aborting {
            info!(operation = %id, "aborting remaining work after failure");
            self.aborting = true;
        }

        for d in graph.downstream_closure(index) {
            if self.records[d].status.is_terminal() {
                continue;
            }
            let blocked = &mut self.records[d];
            blocked.status = OperationStatus::Blocked;
            self.sink.report(&BuildEvent::OperationBlocked {
                id: blocked.id.clone(),
                blocked_by: id.clone(),
            });

            let reason = SkipReason::Blocked(id.clone());
            blocked.status = OperationStatus::Skipped;
            blocked.skip_reason = Some(reason.clone());
            self.sink.report(&BuildEvent::OperationSkipped {
                id: blocked.id.clone(),
                reason,
            });
        }
    }

    /// Skip every operation that never reached a terminal status
    fn skip_remaining(&mut self, reason: SkipReason) {
        self.ready.clear();
        for record in &mut self.records {
            if record.status.is_terminal() {
                continue;
            }
            record.status = OperationStatus::Skipped;
            record.skip_reason = Some(reason.clone());
            self.sink.report(&BuildEvent::OperationSkipped {
                id: record.id.clone(),
                reason: reason.clone(),
            });
        }
    }

    fn into_records(self) -> Vec<OperationRecord> {
        let mut slots: Vec<Option<OperationRecord>> = self.records.into_iter().map(Some).collect();
        self.graph
            .sorted()
            .iter()
            .filter_map(|&i| slots[i].take())
            .collect()
    }
}
