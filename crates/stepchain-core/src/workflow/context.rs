//! Execution context, workflow state and the per-step view handed to user code.
//!
//! `ExecutionContext` is the engine's mutable environment for one execution:
//! the data piped through the chain, the shared `WorkflowState` bag, the
//! step-output history and the cancel signal. Steps never see it directly;
//! each step receives an owned [`StepContext`] snapshot instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use stepchain_types::event::WorkflowEvent;
use stepchain_types::execution::HistoryEntry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::StepError;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Key/value bag shared by every branch of an execution.
///
/// Updated only through pure transforms applied under a mutex. A handle may
/// carry fences; once any of its fences is raised, updates through that
/// handle are discarded. Race losers are fenced this way.
#[derive(Clone, Default)]
pub struct WorkflowState {
    bag: Arc<Mutex<Map<String, Value>>>,
    fences: Vec<Arc<AtomicBool>>,
}

impl WorkflowState {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            bag: Arc::new(Mutex::new(initial)),
            fences: Vec::new(),
        }
    }

    /// Replace the bag with `f(prev)`.
    ///
    /// Returns `false` (and leaves the bag untouched) if this handle is fenced.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Map<String, Value>) -> Map<String, Value>,
    {
        let mut bag = self.bag.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_fenced() {
            return false;
        }
        let next = f(&bag);
        *bag = next;
        true
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        self.update(move |prev| {
            let mut next = prev.clone();
            next.insert(key, value);
            next
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.bag.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_fenced(&self) -> bool {
        self.fences.iter().any(|f| f.load(Ordering::SeqCst))
    }

    /// A handle onto the same bag with one more fence.
    pub(crate) fn fenced(&self, fence: Arc<AtomicBool>) -> Self {
        let mut fences = self.fences.clone();
        fences.push(fence);
        Self {
            bag: Arc::clone(&self.bag),
            fences,
        }
    }

    /// Raise `fences` while holding the bag lock, so no update that starts
    /// after this returns can slip through.
    pub(crate) fn raise_fences(&self, fences: &[Arc<AtomicBool>]) {
        let _bag = self.bag.lock().unwrap_or_else(PoisonError::into_inner);
        for fence in fences {
            fence.store(true, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowState")
            .field("bag", &self.snapshot())
            .field("fenced", &self.is_fenced())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable environment of one running execution (or one parallel branch).
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub chain_id: String,
    pub data: Value,
    pub state: WorkflowState,
    pub history: Vec<HistoryEntry>,
    pub cancel: CancellationToken,
    /// Entries before this index were inherited from the parent context.
    history_base: usize,
    events: EventBus,
    /// Scheduler time for a wake-up; the wall clock otherwise.
    clock: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        chain_id: impl Into<String>,
        data: Value,
        state: WorkflowState,
        history: Vec<HistoryEntry>,
        cancel: CancellationToken,
        events: EventBus,
    ) -> Self {
        Self {
            execution_id,
            chain_id: chain_id.into(),
            data,
            state,
            history,
            cancel,
            history_base: 0,
            events,
            clock: None,
        }
    }

    /// Read the time from `now` instead of the wall clock.
    pub(crate) fn with_clock(mut self, now: Option<DateTime<Utc>>) -> Self {
        self.clock = now;
        self
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// Context for a parallel branch: its own data copy, the parent's history
    /// followed by `own_history`, and the given cancel token and state handle.
    pub(crate) fn fork(
        &self,
        data: Value,
        cancel: CancellationToken,
        state: WorkflowState,
        own_history: Vec<HistoryEntry>,
    ) -> Self {
        let mut history = self.history.clone();
        let history_base = history.len();
        history.extend(own_history);
        Self {
            execution_id: self.execution_id,
            chain_id: self.chain_id.clone(),
            data,
            state,
            history,
            cancel,
            history_base,
            events: self.events.clone(),
            clock: self.clock,
        }
    }

    /// History entries appended since this context was forked.
    pub(crate) fn into_own_history(mut self) -> Vec<HistoryEntry> {
        self.history.split_off(self.history_base)
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn step_context(&self, step_id: &str, resume: Option<Value>) -> StepContext {
        StepContext {
            execution_id: self.execution_id,
            step_id: step_id.to_string(),
            data: self.data.clone(),
            state: self.state.clone(),
            history: self.history.clone(),
            resume,
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What a step's logic sees: an owned snapshot of the execution context plus
/// capabilities to suspend, report progress and observe cancellation.
#[derive(Debug, Clone)]
pub struct StepContext {
    execution_id: Uuid,
    step_id: String,
    data: Value,
    state: WorkflowState,
    history: Vec<HistoryEntry>,
    resume: Option<Value>,
    cancel: CancellationToken,
    events: EventBus,
}

impl StepContext {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The value entering this step.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Deserialize the entering value.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Most recent output recorded for `step_id`.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.step_id == step_id)
            .map(|entry| &entry.output)
    }

    /// The validated resume payload, when this step is being resumed.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    pub fn resume_as<T: DeserializeOwned>(&self) -> Result<Option<T>, StepError> {
        match &self.resume {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn suspend(&self, reason: impl Into<String>) -> StepError {
        StepError::Suspend {
            reason: reason.into(),
            payload: None,
        }
    }

    pub fn suspend_with(&self, reason: impl Into<String>, payload: Value) -> StepError {
        StepError::Suspend {
            reason: reason.into(),
            payload: Some(payload),
        }
    }

    /// Publish an incremental value for this step.
    pub fn progress(&self, value: Value) {
        self.events.publish(WorkflowEvent::StepProgress {
            execution_id: self.execution_id,
            step_id: self.step_id.clone(),
            value,
        });
    }
}
