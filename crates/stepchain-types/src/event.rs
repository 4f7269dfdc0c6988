//! Event types for the workflow event bus.
//!
//! `WorkflowEvent` is broadcast while executions run. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events emitted during chain execution.
///
/// Subscribers (UIs, loggers, schedulers) receive execution lifecycle
/// transitions and per-step progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // -- Execution lifecycle --

    /// A new execution started.
    ExecutionStarted { execution_id: Uuid, chain_id: String },

    /// A suspended execution was resumed.
    ExecutionResumed {
        execution_id: Uuid,
        chain_id: String,
        step_id: String,
    },

    /// The execution paused and a suspension record was written.
    ExecutionSuspended {
        execution_id: Uuid,
        step_id: String,
        reason: String,
        wake_at: Option<DateTime<Utc>>,
    },

    /// The execution produced its final result.
    ExecutionCompleted { execution_id: Uuid, duration_ms: u64 },

    /// A step failure terminated the execution.
    ExecutionFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
    },

    /// The execution observed its cancel signal and stopped.
    ExecutionCancelled {
        execution_id: Uuid,
        step_id: Option<String>,
    },

    // -- Step lifecycle --

    /// A step started executing.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        kind: String,
    },

    /// A step completed and its output became the chain's data.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        output: Value,
        duration_ms: u64,
    },

    /// A step failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
    },

    /// Incremental output emitted by a running step.
    StepProgress {
        execution_id: Uuid,
        step_id: String,
        value: Value,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::ExecutionResumed { execution_id, .. }
            | WorkflowEvent::ExecutionSuspended { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepProgress { execution_id, .. } => *execution_id,
        }
    }

    /// Returns the step id for step-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepProgress { step_id, .. } => Some(step_id),

            WorkflowEvent::ExecutionStarted { .. }
            | WorkflowEvent::ExecutionResumed { .. }
            | WorkflowEvent::ExecutionSuspended { .. }
            | WorkflowEvent::ExecutionCompleted { .. }
            | WorkflowEvent::ExecutionFailed { .. }
            | WorkflowEvent::ExecutionCancelled { .. } => None,
        }
    }
}
