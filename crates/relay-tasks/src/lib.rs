//! Relay Tasks - incremental operation scheduler
//!
//! This crate turns projects and phase declarations into a graph of
//! operations, derives content-addressed fingerprints for them, and executes
//! the graph with bounded parallelism, cache short-circuiting and failure
//! propagation.

pub mod analyzer;
pub mod cache;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod hasher;
pub mod hooks;
pub mod operation;
pub mod project;
pub mod reporter;
pub mod runner;

pub use analyzer::{
    AnalyzerError, FileHashProvider, FileHashes, FsHashProvider, ProjectChangeAnalyzer,
    ProjectState,
};
pub use cache::{CacheEntry, CacheError, CacheStore, LocalCacheStore, MemoryCacheStore};
pub use executor::{
    BuildOutcome, BuildResult, ExecutorOptions, OperationExecutor, OperationRecord, SkipReason,
};
pub use fingerprint::{Fingerprint, FingerprintBuilder, FingerprintError};
pub use graph::{GraphError, GraphSnapshot, OperationGraph, OperationNode, ProjectSelection};
pub use hasher::ContentHasher;
pub use hooks::{HookRegistry, OperationHook};
pub use operation::{OperationId, OperationStatus};
pub use project::{Phase, Project};
pub use reporter::{BuildEvent, ResultSink, SinkRegistry, TracingSink};
pub use runner::{Runner, RunnerContext, RunnerOutput, RunnerStatus, ShellRunner};
