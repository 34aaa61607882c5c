//! Operation lifecycle hooks
//!
//! Hooks are registered before a run starts and handed to the executor as an
//! ordered list. They are called from the task executing the operation, in
//! registration order:
//! - before-execute: right before the runner is invoked
//! - after-execute: after the runner returned, whatever the result
//! - on-failure: after `after-execute` when the runner failed, and on its own
//!   when the runner panicked
//!
//! Cache hits and no-op operations never invoke the runner, so no hook fires
//! for them.

use std::fmt;
use std::sync::Arc;

use crate::runner::{RunnerContext, RunnerOutput};

/// Hook lifecycle stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// Before the runner is invoked
    BeforeExecute,
    /// After the runner returned
    AfterExecute,
    /// The runner reported a failure
    OnFailure,
}

impl HookStage {
    /// Get the stage name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeExecute => "before-execute",
            Self::AfterExecute => "after-execute",
            Self::OnFailure => "on-failure",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks around an operation's execution.
///
/// Every method has an empty default so a hook only implements the stages it
/// cares about.
pub trait OperationHook: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn before_execute(&self, _ctx: &RunnerContext) {}

    fn after_execute(&self, _ctx: &RunnerContext, _output: &RunnerOutput) {}

    fn on_failure(&self, _ctx: &RunnerContext, _error: &str) {}
}

/// Ordered hook registrations for one run
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn OperationHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: OperationHook + 'static>(&mut self, hook: H) {
        self.hooks.push(Arc::new(hook));
    }

    /// Register a hook the caller keeps a handle to
    pub fn register_shared(&mut self, hook: Arc<dyn OperationHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) fn before_execute(&self, ctx: &RunnerContext) {
        for hook in &self.hooks {
            tracing::trace!(hook = hook.name(), stage = %HookStage::BeforeExecute, operation = %ctx.id);
            hook.before_execute(ctx);
        }
    }

    pub(crate) fn after_execute(&self, ctx: &RunnerContext, output: &RunnerOutput) {
        for hook in &self.hooks {
            tracing::trace!(hook = hook.name(), stage = %HookStage::AfterExecute, operation = %ctx.id);
            hook.after_execute(ctx, output);
        }
    }

    pub(crate) fn on_failure(&self, ctx: &RunnerContext, error: &str) {
        for hook in &self.hooks {
            tracing::trace!(hook = hook.name(), stage = %HookStage::OnFailure, operation = %ctx.id);
            hook.on_failure(ctx, error);
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationId;
    use crate::project::{Phase, Project};
    use crate::runner::RunnerStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl OperationHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn before_execute(&self, ctx: &RunnerContext) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:before:{}", self.name, ctx.id));
        }

        fn on_failure(&self, _ctx: &RunnerContext, error: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:failure:{}", self.name, error));
        }
    }

    fn context() -> RunnerContext {
        RunnerContext {
            id: OperationId::new("core", "build"),
            project: Arc::new(Project::new("core", "core")),
            phase: Arc::new(Phase::new("build")),
            root_dir: std::path::PathBuf::from("."),
            fingerprint: None,
        }
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(HookStage::BeforeExecute.as_str(), "before-execute");
        assert_eq!(HookStage::OnFailure.to_string(), "on-failure");
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(Recorder {
            name: "first",
            calls: calls.clone(),
        });
        registry.register(Recorder {
            name: "second",
            calls: calls.clone(),
        });
        assert_eq!(registry.len(), 2);

        let ctx = context();
        registry.before_execute(&ctx);
        registry.after_execute(
            &ctx,
            &RunnerOutput::new(RunnerStatus::Failure("boom".into()), Duration::ZERO, ""),
        );
        registry.on_failure(&ctx, "boom");

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "first:before:core:build",
                "second:before:core:build",
                "first:failure:boom",
                "second:failure:boom",
            ]
        );
    }

    #[test]
    fn test_debug_lists_names() {
        let mut registry = HookRegistry::new();
        assert!(registry.is_empty());
        registry.register(Recorder {
            name: "audit",
            calls: Arc::default(),
        });
        assert_eq!(format!("{:?}", registry), "[\"audit\"]");
    }
}
