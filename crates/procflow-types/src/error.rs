//! Error types for workflow definition validation and capability invocation.
//!
//! `DefinitionError` covers everything preflight validation can reject before
//! a single step runs. `CapabilityError` is the dispatcher-facing failure
//! type whose transient/permanent split drives retry decisions.
//! `WorkflowAborted` is the fatal run outcome (critical step failure or
//! deadline expiry) surfaced to the caller instead of a trace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural errors in a workflow definition.
///
/// All variants are detected by preflight validation, before execution
/// starts, and are always fatal to the run request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("group '{0}' has no children")]
    EmptyGroup(String),

    #[error("invalid workflow name '{0}': must start with a letter or underscore and contain only alphanumerics, underscores, or dashes")]
    InvalidWorkflowName(String),

    #[error("invalid step id '{0}': must start with a letter or underscore and contain only alphanumerics, underscores, or dashes")]
    InvalidStepId(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("invalid variable name '{name}' in `produces` of step '{step_id}': must start with a letter or underscore and contain only alphanumerics or underscores")]
    InvalidVariableName { step_id: String, name: String },

    #[error("variable '{name}' is produced by both step '{first}' and step '{second}'")]
    DuplicateProduces {
        name: String,
        first: String,
        second: String,
    },

    #[error("invalid variable reference '${reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("step '{step_id}' references variable '{variable}' which is neither an initial variable nor produced by any step ordered before it")]
    UnresolvedVariable { step_id: String, variable: String },

    #[error("cyclic variable dependency among parallel steps: {cycle}")]
    CyclicDependency { cycle: String },

    #[error("step '{step_id}' uses unknown capability '{capability}'")]
    UnknownCapability {
        step_id: String,
        capability: String,
    },

    #[error("invalid retry configuration on step '{step_id}': {reason}")]
    InvalidRetry { step_id: String, reason: String },

    #[error("invalid timeout on step '{step_id}': {reason}")]
    InvalidTimeout { step_id: String, reason: String },

    #[error("invalid workflow timeout: {0}")]
    InvalidWorkflowTimeout(String),

    #[error("invalid workflow concurrency: {0}")]
    InvalidConcurrency(String),

    #[error("invalid condition on step '{step_id}': {reason}")]
    InvalidCondition { step_id: String, reason: String },

    #[error("on_failure nesting under step '{step_id}' exceeds the maximum depth of {max_depth}")]
    FallbackTooDeep { step_id: String, max_depth: usize },
}

/// Error returned by a capability invocation.
///
/// The transient/permanent split drives the retry engine: transient failures
/// are eligible for further attempts, permanent failures short-circuit the
/// retry loop even when attempts remain. A per-attempt timeout counts as
/// transient.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    /// Retry-eligible failure (network blip, timeout, rate limit).
    #[error("transient capability failure: {message}")]
    Transient { message: String },

    /// Retry-ineligible failure (bad input, missing resource, logic error).
    #[error("permanent capability failure: {message}")]
    Permanent { message: String },
}

impl CapabilityError {
    pub fn transient(message: impl Into<String>) -> Self {
        CapabilityError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        CapabilityError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            CapabilityError::Transient { message } | CapabilityError::Permanent { message } => {
                message
            }
        }
    }

    /// Classification carried into `StepResult.error_kind`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapabilityError::Transient { .. } => ErrorKind::Transient,
            CapabilityError::Permanent { .. } => ErrorKind::Permanent,
        }
    }
}

/// Transient/permanent classification recorded in step results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Fatal run outcome: the workflow was aborted mid-flight.
///
/// Surfaced as the error of `run`/`wait`, never embedded in a trace.
/// Non-critical failures do not abort; they degrade the trace status to
/// `PartialFailure` instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowAborted {
    #[error("critical step '{step_id}' failed: {error}")]
    CriticalStepFailed { step_id: String, error: String },

    #[error("workflow deadline of {timeout_secs}s exceeded")]
    DeadlineExceeded { timeout_secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_display() {
        let err = DefinitionError::DuplicateProduces {
            name: "report".to_string(),
            first: "fetch".to_string(),
            second: "refetch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "variable 'report' is produced by both step 'fetch' and step 'refetch'"
        );
    }

    #[test]
    fn test_unresolved_variable_display() {
        let err = DefinitionError::UnresolvedVariable {
            step_id: "publish".to_string(),
            variable: "report".to_string(),
        };
        assert!(err.to_string().contains("'publish'"));
        assert!(err.to_string().contains("'report'"));
    }

    #[test]
    fn test_capability_error_classification() {
        let transient = CapabilityError::transient("connection reset");
        let permanent = CapabilityError::permanent("file not found");

        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert_eq!(permanent.kind(), ErrorKind::Permanent);
        assert_eq!(transient.message(), "connection reset");
        assert_eq!(permanent.message(), "file not found");
    }

    #[test]
    fn test_capability_error_display() {
        let err = CapabilityError::transient("rate limited");
        assert_eq!(err.to_string(), "transient capability failure: rate limited");
    }

    #[test]
    fn test_workflow_aborted_display() {
        let err = WorkflowAborted::CriticalStepFailed {
            step_id: "deploy".to_string(),
            error: "permanent capability failure: quota exhausted".to_string(),
        };
        assert!(err.to_string().starts_with("critical step 'deploy' failed"));

        let err = WorkflowAborted::DeadlineExceeded { timeout_secs: 600 };
        assert_eq!(err.to_string(), "workflow deadline of 600s exceeded");
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::Transient).unwrap();
        assert_eq!(json, "\"transient\"");
        let parsed: ErrorKind = serde_json::from_str("\"permanent\"").unwrap();
        assert_eq!(parsed, ErrorKind::Permanent);
    }
}
