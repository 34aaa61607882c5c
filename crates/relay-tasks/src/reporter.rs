//! Build result reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::executor::{BuildOutcome, SkipReason};
use crate::graph::GraphSnapshot;
use crate::operation::{OperationId, OperationStatus};

/// Events emitted during a build run
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// Topology of the graph about to run
    GraphSnapshot(GraphSnapshot),
    /// An operation was dispatched to the runner
    OperationStarted {
        id: OperationId,
        command: Option<String>,
    },
    /// An operation reached a terminal status
    OperationFinished {
        id: OperationId,
        status: OperationStatus,
        duration: Duration,
        from_cache: bool,
    },
    /// An upstream failure blocked this operation
    OperationBlocked {
        id: OperationId,
        blocked_by: OperationId,
    },
    /// An operation will not run
    OperationSkipped { id: OperationId, reason: SkipReason },
    /// Non-fatal degradation, e.g. a fingerprint could not be derived
    Advisory { id: OperationId, message: String },
    /// The run is over
    RunFinished {
        outcome: BuildOutcome,
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        from_cache: usize,
        duration: Duration,
    },
}

/// Receiver of build events.
///
/// Sinks are called from the scheduler loop, so they must not block for long.
pub trait ResultSink: Send + Sync {
    /// Handle a build event
    fn report(&self, event: &BuildEvent);
}

/// Sink that logs to tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn report(&self, event: &BuildEvent) {
        match event {
            BuildEvent::GraphSnapshot(snapshot) => {
                tracing::debug!(operations = snapshot.operations.len(), "graph snapshot");
            }
            BuildEvent::OperationStarted { id, command } => {
                tracing::info!("Starting {}: {}", id, command.as_deref().unwrap_or("<no-op>"));
            }
            BuildEvent::OperationFinished {
                id,
                status,
                duration,
                from_cache,
            } => match status {
                OperationStatus::Failure => {
                    tracing::error!("{} failed after {:.1}s", id, duration.as_secs_f64());
                }
                _ if *from_cache => {
                    tracing::info!("{} restored from cache", id);
                }
                _ => {
                    tracing::info!("{} {} in {:.1}s", id, status, duration.as_secs_f64());
                }
            },
            BuildEvent::OperationBlocked { id, blocked_by } => {
                tracing::warn!("{} blocked by {}", id, blocked_by);
            }
            BuildEvent::OperationSkipped { id, reason } => {
                tracing::info!("{} skipped: {}", id, reason);
            }
            BuildEvent::Advisory { id, message } => {
                tracing::warn!("{}: {}", id, message);
            }
            BuildEvent::RunFinished {
                outcome,
                total,
                succeeded,
                failed,
                skipped,
                from_cache,
                duration,
            } => {
                tracing::info!(
                    "Build {}: {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s)",
                    outcome,
                    succeeded,
                    total,
                    failed,
                    skipped,
                    from_cache,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Sink that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectingSink {
    /// Get all collected events
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ResultSink for CollectingSink {
    fn report(&self, event: &BuildEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Ordered set of sinks that receive every event
pub struct SinkRegistry {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            sinks: vec![Arc::new(TracingSink)],
        }
    }

    pub fn empty() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<S: ResultSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Arc::new(sink));
    }

    /// Register a sink the caller keeps a handle to
    pub fn register_shared(&mut self, sink: Arc<dyn ResultSink>) {
        self.sinks.push(sink);
    }

    pub fn all(&self) -> &[Arc<dyn ResultSink>] {
        &self.sinks
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSink for SinkRegistry {
    fn report(&self, event: &BuildEvent) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::default();
        let id = OperationId::new("core", "build");

        sink.report(&BuildEvent::OperationStarted {
            id: id.clone(),
            command: Some("cargo build".to_string()),
        });
        sink.report(&BuildEvent::OperationFinished {
            id,
            status: OperationStatus::Success,
            duration: Duration::from_secs(5),
            from_cache: false,
        });

        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn test_tracing_sink() {
        let sink = TracingSink;
        let id = OperationId::new("core", "build");

        // Just verify it doesn't panic
        sink.report(&BuildEvent::OperationSkipped {
            id: id.clone(),
            reason: SkipReason::Blocked(OperationId::new("core", "lint")),
        });
        sink.report(&BuildEvent::Advisory {
            id,
            message: "fingerprint unavailable".to_string(),
        });
    }

    #[test]
    fn test_empty_registry() {
        let registry = SinkRegistry::empty();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_broadcast() {
        let collecting = Arc::new(CollectingSink::default());
        let mut registry = SinkRegistry::new();
        registry.register_shared(collecting.clone());
        assert_eq!(registry.all().len(), 2);

        registry.report(&BuildEvent::OperationBlocked {
            id: OperationId::new("app", "build"),
            blocked_by: OperationId::new("lib", "build"),
        });

        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_register() {
        let mut registry = SinkRegistry::empty();
        registry.register(TracingSink);
        registry.register(CollectingSink::default());
        assert_eq!(registry.all().len(), 2);
    }
}
