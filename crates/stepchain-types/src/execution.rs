//! Execution records: history entries, suspension cursors and records, start
//! results and status reports.
//!
//! Everything here is serializable so that a suspended execution can be
//! written to a store by one process and resumed by another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CancellationError, StepExecutionError};

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One entry of the append-only step-output history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub output: Value,
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Position inside a chain where execution paused.
///
/// `data` is the value that entered the step at `step_index`, so re-entering
/// that step reproduces the exact input it saw before suspending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub step_index: usize,
    pub step_id: String,
    pub data: Value,
    /// Nested position when the step at `step_index` is a combinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<StepCursor>>,
}

/// Nested position inside a combinator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCursor {
    /// Inside the chain chosen by `and_when` (case 0) or `and_branch`.
    /// For `and_branch` the default chain is addressed as `cases.len()`.
    Splice { case: usize, cursor: ChainCursor },
    /// Inside `and_all`: one slot per branch.
    Fanout { slots: Vec<BranchSlot> },
    /// Inside the branch an `and_race` adopted.
    Race {
        branch: usize,
        cursor: ChainCursor,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        history: Vec<HistoryEntry>,
    },
    /// Inside `and_for_each`: the window starting at `start` is in progress.
    ForEach {
        items: Vec<Value>,
        start: usize,
        outputs: Vec<Value>,
        slots: Vec<BranchSlot>,
    },
    /// Inside iteration `iteration` (0-based) of a loop body.
    Loop { iteration: u64, cursor: ChainCursor },
    /// A sleep waiting for its wake time.
    Sleep { wake_at: DateTime<Utc> },
}

/// Sub-state of one parallel branch at suspension time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchSlot {
    /// The branch finished; its result is cached and it is not re-run.
    Completed {
        output: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        history: Vec<HistoryEntry>,
    },
    /// The branch is paused at `cursor`.
    Suspended {
        cursor: ChainCursor,
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        history: Vec<HistoryEntry>,
    },
}

// ---------------------------------------------------------------------------
// SuspensionRecord
// ---------------------------------------------------------------------------

/// Durable snapshot of a paused execution.
///
/// Immutable once written; consumed exactly once by a successful resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub execution_id: Uuid,
    pub chain_id: String,
    /// Index of the top-level step that suspended.
    pub step_index: usize,
    /// Id of the top-level step that suspended.
    pub step_id: String,
    /// Id of the innermost step that called `suspend`.
    pub leaf_step_id: String,
    pub reason: String,
    /// Data entering the top-level step at `step_index`.
    pub data_snapshot: Value,
    pub workflow_state_snapshot: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Slash-separated path to the leaf step whose resume schema applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_schema_ref: Option<String>,
    /// Extra data the step attached when it suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,
    /// When a sleeping step becomes due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    pub cursor: ChainCursor,
    pub suspended_at: DateTime<Utc>,
}

/// A record as held by a store, with its consumption marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSuspension {
    pub record: SuspensionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl StoredSuspension {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// StartResult
// ---------------------------------------------------------------------------

/// Outcome of `start` or `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartResult {
    Completed {
        execution_id: Uuid,
        result: Value,
    },
    Suspended {
        execution_id: Uuid,
        step_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wake_at: Option<DateTime<Utc>>,
    },
    Failed {
        execution_id: Uuid,
        error: StepExecutionError,
    },
    Cancelled {
        execution_id: Uuid,
        error: CancellationError,
    },
}

impl StartResult {
    pub fn execution_id(&self) -> Uuid {
        match self {
            StartResult::Completed { execution_id, .. }
            | StartResult::Suspended { execution_id, .. }
            | StartResult::Failed { execution_id, .. }
            | StartResult::Cancelled { execution_id, .. } => *execution_id,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            StartResult::Completed { .. } => ExecutionStatus::Completed,
            StartResult::Suspended { .. } => ExecutionStatus::Suspended,
            StartResult::Failed { .. } => ExecutionStatus::Failed,
            StartResult::Cancelled { .. } => ExecutionStatus::Cancelled,
        }
    }

    /// The final result, if the execution completed.
    pub fn result(&self) -> Option<&Value> {
        match self {
            StartResult::Completed { result, .. } => Some(result),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Answer to a `status` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub execution_id: Uuid,
    pub chain_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_step_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
