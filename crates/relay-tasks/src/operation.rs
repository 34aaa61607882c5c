//! Operation identity and lifecycle status

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of an operation: one phase of one project
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId {
    /// Project name
    pub project: String,
    /// Phase name (e.g., "build", "test")
    pub phase: String,
}

impl OperationId {
    /// Create a new operation ID
    pub fn new(project: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            phase: phase.into(),
        }
    }

    /// Parse an operation ID from "project:phase" format
    pub fn parse(s: &str) -> Option<Self> {
        let (project, phase) = s.split_once(':')?;
        if project.is_empty() || phase.is_empty() {
            return None;
        }
        Some(Self::new(project, phase))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.phase)
    }
}

/// Lifecycle status of an operation.
///
/// `Ready -> Queued -> Executing -> {Success | SuccessWithWarnings | Failure | FromCache | NoOp}`,
/// with the side path `Ready/Queued -> Blocked -> Skipped` when an upstream fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Waiting for upstream operations
    Ready,
    /// All upstream operations succeeded; waiting for a free slot
    Queued,
    /// Dispatched
    Executing,
    /// Runner succeeded
    Success,
    /// Runner succeeded but reported warnings
    SuccessWithWarnings,
    /// Runner failed
    Failure,
    /// An upstream operation failed; this one will not run
    Blocked,
    /// Not run (blocked, aborted or cancelled)
    Skipped,
    /// Previous result restored from the cache
    FromCache,
    /// Nothing to do for this project
    NoOp,
}

impl OperationStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::SuccessWithWarnings
                | Self::Failure
                | Self::Skipped
                | Self::FromCache
                | Self::NoOp
        )
    }

    /// Whether downstream operations may proceed after this status
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::SuccessWithWarnings | Self::FromCache | Self::NoOp
        )
    }

    /// Short lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::SuccessWithWarnings => "success-with-warnings",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
            Self::FromCache => "from-cache",
            Self::NoOp => "no-op",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_display() {
        let id = OperationId::new("core", "build");
        assert_eq!(id.to_string(), "core:build");
    }

    #[test]
    fn test_operation_id_parse() {
        let id = OperationId::parse("core:build").unwrap();
        assert_eq!(id.project, "core");
        assert_eq!(id.phase, "build");
    }

    #[test]
    fn test_operation_id_parse_invalid() {
        assert!(OperationId::parse("nobuild").is_none());
        assert!(OperationId::parse(":build").is_none());
        assert!(OperationId::parse("core:").is_none());
    }

    #[test]
    fn test_status_success_set() {
        assert!(OperationStatus::Success.is_success());
        assert!(OperationStatus::SuccessWithWarnings.is_success());
        assert!(OperationStatus::FromCache.is_success());
        assert!(OperationStatus::NoOp.is_success());
        assert!(!OperationStatus::Failure.is_success());
        assert!(!OperationStatus::Skipped.is_success());
        assert!(!OperationStatus::Blocked.is_success());
    }

    #[test]
    fn test_status_terminal_set() {
        assert!(!OperationStatus::Ready.is_terminal());
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Executing.is_terminal());
        assert!(!OperationStatus::Blocked.is_terminal());
        assert!(OperationStatus::Skipped.is_terminal());
        assert!(OperationStatus::Failure.is_terminal());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&OperationStatus::SuccessWithWarnings).unwrap();
        assert_eq!(json, "\"success-with-warnings\"");
    }
}
