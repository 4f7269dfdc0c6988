use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from repository operations (used by the store traits in stepchain-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The record exists but a previous caller already consumed it.
    #[error("record already consumed")]
    Consumed,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single schema violation, addressed by a JSON path such as `$.items[2].id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// What a failed validation was checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTarget {
    Input,
    Result,
    ResumePayload,
    StepInput,
    StepOutput,
    DelegateOutput,
}

impl fmt::Display for ValidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationTarget::Input => "workflow input",
            ValidationTarget::Result => "workflow result",
            ValidationTarget::ResumePayload => "resume payload",
            ValidationTarget::StepInput => "step input",
            ValidationTarget::StepOutput => "step output",
            ValidationTarget::DelegateOutput => "delegate output",
        };
        f.write_str(s)
    }
}

/// A value failed its declared shape. Always recoverable by the caller.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{target} failed validation: {}", join_violations(.violations))]
pub struct ValidationError {
    pub target: ValidationTarget,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(target: ValidationTarget, violations: Vec<Violation>) -> Self {
        Self { target, violations }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Step execution failures
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step's own logic returned an error.
    StepFailed,
    /// No `and_branch` case matched and no default was declared.
    NoBranchMatched,
    /// Data entering the step violated its input schema.
    InvalidInput,
    /// Data produced by the step violated its output schema.
    InvalidOutput,
    /// The final data violated the chain's result schema.
    ResultValidation,
    /// The delegate invocation failed or returned a non-conforming value.
    Delegate,
    /// A guardrail check blocked the data outright.
    GuardrailBlocked,
    /// A reviewer rejected data held by a guardrail.
    GuardrailRejected,
    /// `and_for_each` received something other than an array.
    NotASequence,
    /// The step exceeded the configured step timeout.
    Timeout,
    /// A branch task panicked.
    TaskPanicked,
    /// The resume cursor no longer matches the chain definition.
    StaleCursor,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::StepFailed => "step failed",
            FailureKind::NoBranchMatched => "no branch matched",
            FailureKind::InvalidInput => "invalid input",
            FailureKind::InvalidOutput => "invalid output",
            FailureKind::ResultValidation => "invalid result",
            FailureKind::Delegate => "delegate error",
            FailureKind::GuardrailBlocked => "guardrail blocked",
            FailureKind::GuardrailRejected => "guardrail rejected",
            FailureKind::NotASequence => "not a sequence",
            FailureKind::Timeout => "timed out",
            FailureKind::TaskPanicked => "task panicked",
            FailureKind::StaleCursor => "stale cursor",
        };
        f.write_str(s)
    }
}

/// A step failed and terminated the execution.
///
/// Carries the failing step id and the data the step was given, so the
/// failing input can be reproduced without re-running prior steps.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("step '{step_id}' failed ({kind}): {cause}")]
pub struct StepExecutionError {
    pub step_id: String,
    pub kind: FailureKind,
    pub cause: String,
    /// Snapshot of `ctx.data` at the time of failure.
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    /// Outcomes of every branch when the failing step is a parallel combinator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchDiagnostic>,
}

impl StepExecutionError {
    pub fn new(
        step_id: impl Into<String>,
        kind: FailureKind,
        cause: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            cause: cause.into(),
            data,
            violations: Vec::new(),
            branches: Vec::new(),
        }
    }

    /// Build a failure from a validation error, keeping its violations.
    pub fn from_validation(
        step_id: impl Into<String>,
        kind: FailureKind,
        error: ValidationError,
        data: Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            cause: error.to_string(),
            data,
            violations: error.violations,
            branches: Vec::new(),
        }
    }
}

/// How one branch of a parallel combinator settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDiagnostic {
    pub branch: usize,
    pub outcome: BranchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BranchOutcome {
    Completed { output: Value },
    Suspended { step_id: String, reason: String },
    Failed { step_id: String, cause: String },
    Cancelled,
}

/// Execution stopped cooperatively via the cancel signal. Not resumable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("execution cancelled{}", cancel_suffix(.step_id))]
pub struct CancellationError {
    /// The step that observed the cancellation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

fn cancel_suffix(step_id: &Option<String>) -> String {
    step_id
        .as_ref()
        .map(|s| format!(" before step '{s}'"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
        assert_eq!(RepositoryError::Consumed.to_string(), "record already consumed");
    }

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = ValidationError::new(
            ValidationTarget::ResumePayload,
            vec![
                Violation::new("$.approved", "expected bool, got string"),
                Violation::new("$.managerId", "required field is missing"),
            ],
        );
        let msg = err.to_string();
        assert!(msg.starts_with("resume payload failed validation"));
        assert!(msg.contains("$.approved: expected bool"));
        assert!(msg.contains("$.managerId: required field is missing"));
    }

    #[test]
    fn test_step_execution_error_names_step() {
        let err = StepExecutionError::new(
            "finalize",
            FailureKind::StepFailed,
            "ledger unavailable",
            json!({ "amount": 10 }),
        );
        assert_eq!(
            err.to_string(),
            "step 'finalize' failed (step failed): ledger unavailable"
        );
    }

    #[test]
    fn test_step_execution_error_serializes_without_empty_diagnostics() {
        let err = StepExecutionError::new(
            "route",
            FailureKind::NoBranchMatched,
            "no case matched",
            json!(null),
        );
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "no_branch_matched");
        assert!(v.get("branches").is_none());
        assert!(v.get("violations").is_none());
    }

    #[test]
    fn test_cancellation_error_display() {
        let err = CancellationError { step_id: None };
        assert_eq!(err.to_string(), "execution cancelled");
        let err = CancellationError {
            step_id: Some("notify".to_string()),
        };
        assert_eq!(err.to_string(), "execution cancelled before step 'notify'");
    }
}
