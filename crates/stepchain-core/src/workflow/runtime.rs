//! Invocation surface: start, resume, status, cancel and timed wake-ups.
//!
//! `WorkflowRuntime` owns the engine, a suspension store and the registry of
//! chains it can resume. It is generic over `S: SuspensionStore` so the same
//! runtime drives the in-memory store in tests and SQLite in production.
//!
//! # Resume flow
//!
//! 1. Peek the record (`NotFound` / `AlreadyConsumed`).
//! 2. Walk its cursor through the registered chain to the paused leaf.
//! 3. Validate the payload against the leaf's resume schema. A rejected
//!    payload leaves the record untouched.
//! 4. Consume the record atomically; only one concurrent resumer wins.
//! 5. Rebuild the context from the snapshots and re-enter the engine.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use stepchain_types::config::EngineConfig;
use stepchain_types::error::{
    FailureKind, RepositoryError, StepExecutionError, ValidationTarget,
};
use stepchain_types::event::WorkflowEvent;
use stepchain_types::execution::{ExecutionStatus, StartResult, StatusReport, SuspensionRecord};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::chain::Chain;
use super::context::{ExecutionContext, WorkflowState};
use super::cursor::{earliest_wake, resolve_leaf};
use super::engine::{ChainOutcome, Engine, Resume};
use super::error::{ResumeError, StartError};
use crate::event::EventBus;
use crate::repository::SuspensionStore;
use crate::schema::check_optional;

#[derive(Debug, Clone)]
struct StatusEntry {
    chain_id: String,
    status: ExecutionStatus,
    last_step_id: Option<String>,
    updated_at: DateTime<Utc>,
}

impl StatusEntry {
    fn report(&self, execution_id: Uuid) -> StatusReport {
        StatusReport {
            execution_id,
            chain_id: self.chain_id.clone(),
            status: self.status,
            last_known_step_id: self.last_step_id.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Outcome of one timed wake-up attempted by [`WorkflowRuntime::wake_due`].
pub type WakeResult = (Uuid, Result<StartResult, ResumeError>);

pub struct WorkflowRuntime<S: SuspensionStore> {
    engine: Engine,
    store: Arc<S>,
    events: EventBus,
    /// Chains this runtime can resume, keyed by chain id.
    chains: DashMap<String, Chain>,
    /// In-process view of executions started or resumed here.
    statuses: DashMap<Uuid, StatusEntry>,
    /// Cancel signals of executions currently running, keyed by execution id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: SuspensionStore> WorkflowRuntime<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            engine: Engine::new(config),
            store,
            events,
            chains: DashMap::new(),
            statuses: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Make `chain` resumable by this runtime. Re-registering an id replaces
    /// the previous definition.
    pub fn register(&self, chain: &Chain) {
        self.chains.insert(chain.id().to_string(), chain.clone());
    }

    /// Subscribe to execution and step events.
    pub fn events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `chain` on `input` until it completes, suspends, fails or is
    /// cancelled. The chain is registered as a side effect.
    pub async fn start(&self, chain: &Chain, input: Value) -> Result<StartResult, StartError> {
        check_optional(chain.input_schema(), ValidationTarget::Input, &input)
            .map_err(StartError::InvalidInput)?;
        self.register(chain);

        let execution_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(execution_id, cancel.clone());
        self.set_status(execution_id, chain.id(), ExecutionStatus::Running, None);
        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            chain_id: chain.id().to_string(),
        });
        tracing::info!(execution_id = %execution_id, chain_id = chain.id(), "execution started");

        let mut ctx = ExecutionContext::new(
            execution_id,
            chain.id(),
            input,
            WorkflowState::default(),
            Vec::new(),
            cancel,
            self.events.clone(),
        );
        let started = Instant::now();
        let span = info_span!("stepchain.execute", execution_id = %execution_id, chain_id = chain.id());
        let outcome = self.engine.run_chain(chain, &mut ctx, None).instrument(span).await;
        self.cancellation_tokens.remove(&execution_id);

        Ok(self.settle(chain, ctx, outcome, started).await?)
    }

    /// Continue a suspended execution with `payload` as the paused step's
    /// resume data.
    pub async fn resume(&self, execution_id: Uuid, payload: Value) -> Result<StartResult, ResumeError> {
        self.resume_with(execution_id, Some(payload), None).await
    }

    /// Shared by `resume` and `wake_due`. A wake-up passes no payload and
    /// runs sleeps against the scheduler's `clock`.
    async fn resume_with(
        &self,
        execution_id: Uuid,
        payload: Option<Value>,
        clock: Option<DateTime<Utc>>,
    ) -> Result<StartResult, ResumeError> {
        let Some(stored) = self.store.peek(&execution_id).await? else {
            return Err(ResumeError::NotFound(execution_id));
        };
        if stored.is_consumed() {
            return Err(ResumeError::AlreadyConsumed(execution_id));
        }
        let record = stored.record;

        let chain = self
            .chains
            .get(&record.chain_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResumeError::UnknownChain(record.chain_id.clone()))?;
        let leaf = resolve_leaf(&chain, &record.cursor)
            .map_err(|detail| ResumeError::StaleRecord { execution_id, detail })?;
        // A time-based wake carries no payload to check.
        if let Some(payload) = &payload {
            check_optional(leaf.resume_schema(), ValidationTarget::ResumePayload, payload)
                .map_err(ResumeError::InvalidPayload)?;
        }

        let consumed = match self.store.load_and_consume(&execution_id).await {
            Ok(consumed) => consumed,
            Err(RepositoryError::Consumed) => return Err(ResumeError::AlreadyConsumed(execution_id)),
            Err(RepositoryError::NotFound) => return Err(ResumeError::NotFound(execution_id)),
            Err(e) => return Err(e.into()),
        };
        if consumed != record {
            // The execution moved on between peek and consume; the payload
            // was checked against a different suspension.
            tracing::warn!(execution_id = %execution_id, "suspension replaced during resume");
            self.store.save(&consumed).await?;
            return Err(ResumeError::AlreadyConsumed(execution_id));
        }

        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(execution_id, cancel.clone());
        self.set_status(
            execution_id,
            &record.chain_id,
            ExecutionStatus::Running,
            Some(record.leaf_step_id.clone()),
        );
        self.events.publish(WorkflowEvent::ExecutionResumed {
            execution_id,
            chain_id: record.chain_id.clone(),
            step_id: record.leaf_step_id.clone(),
        });
        tracing::info!(
            execution_id = %execution_id,
            chain_id = %record.chain_id,
            step_id = %record.leaf_step_id,
            "execution resumed"
        );

        let mut ctx = ExecutionContext::new(
            execution_id,
            record.chain_id,
            record.data_snapshot,
            WorkflowState::new(record.workflow_state_snapshot),
            record.history,
            cancel,
            self.events.clone(),
        )
        .with_clock(clock);
        let resume = Resume {
            cursor: record.cursor,
            payload,
        };
        let started = Instant::now();
        let span = info_span!(
            "stepchain.resume",
            execution_id = %execution_id,
            chain_id = chain.id(),
            woken = clock.is_some(),
        );
        let outcome = self
            .engine
            .run_chain(&chain, &mut ctx, Some(resume))
            .instrument(span)
            .await;
        self.cancellation_tokens.remove(&execution_id);

        Ok(self.settle(&chain, ctx, outcome, started).await?)
    }

    /// Status of an execution known to this runtime or held by the store.
    ///
    /// A consumed record with no in-process entry belongs to an execution
    /// resumed elsewhere and is reported as running.
    pub async fn status(&self, execution_id: Uuid) -> Result<Option<StatusReport>, RepositoryError> {
        let cached = self
            .statuses
            .get(&execution_id)
            .map(|entry| entry.report(execution_id));
        if cached.is_some() {
            return Ok(cached);
        }
        let stored = self.store.peek(&execution_id).await?;
        Ok(stored.map(|stored| {
            let (status, updated_at) = match stored.consumed_at {
                Some(at) => (ExecutionStatus::Running, at),
                None => (ExecutionStatus::Suspended, stored.record.suspended_at),
            };
            StatusReport {
                execution_id,
                chain_id: stored.record.chain_id,
                status,
                last_known_step_id: Some(stored.record.leaf_step_id),
                updated_at,
            }
        }))
    }

    /// Stop an execution. A running one is signalled and stops at its next
    /// safe point; a suspended one has its record consumed so it can never
    /// be resumed. Returns `false` when there is nothing to cancel.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, RepositoryError> {
        let token = self
            .cancellation_tokens
            .get(&execution_id)
            .map(|entry| entry.value().clone());
        if let Some(token) = token {
            token.cancel();
            tracing::info!(execution_id = %execution_id, "cancel signalled");
            return Ok(true);
        }
        let finished = self
            .statuses
            .get(&execution_id)
            .is_some_and(|entry| entry.status.is_terminal());
        if finished {
            return Ok(false);
        }

        match self.store.load_and_consume(&execution_id).await {
            Ok(record) => {
                self.set_status(
                    execution_id,
                    &record.chain_id,
                    ExecutionStatus::Cancelled,
                    Some(record.leaf_step_id.clone()),
                );
                self.events.publish(WorkflowEvent::ExecutionCancelled {
                    execution_id,
                    step_id: Some(record.leaf_step_id),
                });
                tracing::info!(execution_id = %execution_id, "suspended execution cancelled");
                Ok(true)
            }
            Err(RepositoryError::NotFound | RepositoryError::Consumed) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resume every sleeping execution whose wake time is at or before `now`.
    ///
    /// One poll pass for an external scheduler. Each wake-up reports its own
    /// result; one failing does not stop the others.
    pub async fn wake_due(&self, now: DateTime<Utc>) -> Result<Vec<WakeResult>, RepositoryError> {
        let due = self.store.list_due(now).await?;
        let mut woken = Vec::with_capacity(due.len());
        for record in due {
            let execution_id = record.execution_id;
            tracing::debug!(execution_id = %execution_id, wake_at = ?record.wake_at, "waking execution");
            let result = self.resume_with(execution_id, None, Some(now)).await;
            if let Err(e) = &result {
                tracing::warn!(execution_id = %execution_id, error = %e, "wake-up failed");
            }
            woken.push((execution_id, result));
        }
        Ok(woken)
    }

    /// Turn an engine outcome into a `StartResult`, persisting a suspension.
    async fn settle(
        &self,
        chain: &Chain,
        ctx: ExecutionContext,
        outcome: ChainOutcome,
        started: Instant,
    ) -> Result<StartResult, RepositoryError> {
        let execution_id = ctx.execution_id;
        match outcome {
            ChainOutcome::Completed(result) => {
                if let Err(e) = check_optional(chain.result_schema(), ValidationTarget::Result, &result) {
                    let step_id = chain
                        .steps()
                        .last()
                        .map(|s| s.id().to_string())
                        .unwrap_or_else(|| chain.id().to_string());
                    let error = StepExecutionError::from_validation(
                        step_id,
                        FailureKind::ResultValidation,
                        e,
                        result,
                    );
                    return Ok(self.failed(chain, execution_id, error));
                }
                let last_step_id = ctx.history.last().map(|entry| entry.step_id.clone());
                self.set_status(execution_id, chain.id(), ExecutionStatus::Completed, last_step_id);
                let duration_ms = started.elapsed().as_millis() as u64;
                self.events.publish(WorkflowEvent::ExecutionCompleted {
                    execution_id,
                    duration_ms,
                });
                tracing::info!(execution_id = %execution_id, duration_ms, "execution completed");
                Ok(StartResult::Completed {
                    execution_id,
                    result,
                })
            }

            ChainOutcome::Suspended { cursor, point } => {
                let wake_at = earliest_wake(&cursor);
                let record = SuspensionRecord {
                    execution_id,
                    chain_id: chain.id().to_string(),
                    step_index: cursor.step_index,
                    step_id: cursor.step_id.clone(),
                    leaf_step_id: point.step_id.clone(),
                    reason: point.reason.clone(),
                    data_snapshot: cursor.data.clone(),
                    workflow_state_snapshot: ctx.state.snapshot(),
                    history: ctx.history,
                    resume_schema_ref: Some(point.path.join("/")),
                    suspend_payload: point.payload,
                    wake_at,
                    cursor,
                    suspended_at: Utc::now(),
                };
                if let Err(e) = self.store.save(&record).await {
                    tracing::warn!(execution_id = %execution_id, error = %e, "failed to persist suspension");
                    self.set_status(
                        execution_id,
                        chain.id(),
                        ExecutionStatus::Failed,
                        Some(point.step_id),
                    );
                    return Err(e);
                }
                self.set_status(
                    execution_id,
                    chain.id(),
                    ExecutionStatus::Suspended,
                    Some(point.step_id.clone()),
                );
                self.events.publish(WorkflowEvent::ExecutionSuspended {
                    execution_id,
                    step_id: point.step_id.clone(),
                    reason: point.reason.clone(),
                    wake_at,
                });
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %point.step_id,
                    reason = %point.reason,
                    "execution suspended"
                );
                Ok(StartResult::Suspended {
                    execution_id,
                    step_id: point.step_id,
                    reason: point.reason,
                    wake_at,
                })
            }

            ChainOutcome::Failed(error) => Ok(self.failed(chain, execution_id, error)),

            ChainOutcome::Cancelled(error) => {
                self.set_status(
                    execution_id,
                    chain.id(),
                    ExecutionStatus::Cancelled,
                    error.step_id.clone(),
                );
                self.events.publish(WorkflowEvent::ExecutionCancelled {
                    execution_id,
                    step_id: error.step_id.clone(),
                });
                tracing::info!(execution_id = %execution_id, step_id = ?error.step_id, "execution cancelled");
                Ok(StartResult::Cancelled {
                    execution_id,
                    error,
                })
            }
        }
    }

    fn failed(&self, chain: &Chain, execution_id: Uuid, error: StepExecutionError) -> StartResult {
        self.set_status(
            execution_id,
            chain.id(),
            ExecutionStatus::Failed,
            Some(error.step_id.clone()),
        );
        self.events.publish(WorkflowEvent::ExecutionFailed {
            execution_id,
            step_id: error.step_id.clone(),
            error: error.to_string(),
        });
        tracing::info!(
            execution_id = %execution_id,
            step_id = %error.step_id,
            kind = %error.kind,
            "execution failed"
        );
        StartResult::Failed {
            execution_id,
            error,
        }
    }

    fn set_status(
        &self,
        execution_id: Uuid,
        chain_id: &str,
        status: ExecutionStatus,
        last_step_id: Option<String>,
    ) {
        self.statuses.insert(
            execution_id,
            StatusEntry {
                chain_id: chain_id.to_string(),
                status,
                last_step_id,
                updated_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemorySuspensionStore;
    use crate::schema::{Field, Shape, TypedSchema};
    use crate::workflow::chain::{ChainConfig, chain};
    use crate::workflow::error::StepError;
    use crate::workflow::step::{GuardrailVerdict, step};
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    fn runtime() -> WorkflowRuntime<InMemorySuspensionStore> {
        WorkflowRuntime::new(Arc::new(InMemorySuspensionStore::new()), EngineConfig::default())
    }

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    struct Approval {
        approved: bool,
        manager_id: String,
        adjusted_amount: Option<f64>,
    }

    /// Expenses over 500 wait for a manager; the rest are approved by the system.
    fn expense_chain() -> Chain {
        chain(
            ChainConfig::new("expense-approval").input_schema(Shape::object([
                Field::required("amount", Shape::Number),
                Field::optional("employeeId", Shape::String),
            ])),
        )
        .and_then(
            step("check-approval", |ctx| async move {
                let amount = ctx.data()["amount"].clone();
                if amount.as_f64().unwrap_or(0.0) <= 500.0 {
                    return Ok(json!({ "approved": true, "approvedBy": "system", "finalAmount": amount }));
                }
                match ctx.resume_as::<Approval>()? {
                    Some(decision) => {
                        // Keep the caller's number as sent rather than the f64 copy.
                        let adjusted = ctx
                            .resume_data()
                            .and_then(|payload| payload.get("adjustedAmount"))
                            .filter(|v| !v.is_null())
                            .cloned();
                        let final_amount = match (decision.adjusted_amount, adjusted) {
                            (Some(_), Some(raw)) => raw,
                            _ => amount,
                        };
                        Ok(json!({
                            "approved": decision.approved,
                            "approvedBy": decision.manager_id,
                            "finalAmount": final_amount,
                        }))
                    }
                    None => Err(ctx.suspend("manager approval required")),
                }
            })
            .resume_schema(TypedSchema::<Approval>::new()),
        )
        .and_then(step("finalize", |ctx| async move {
            let data = ctx.data();
            let status = if data["approved"] == json!(true) { "approved" } else { "rejected" };
            Ok(json!({
                "status": status,
                "approvedBy": data["approvedBy"].clone(),
                "finalAmount": data["finalAmount"].clone(),
            }))
        }))
        .build()
        .unwrap()
    }

    fn suspended_id(result: &StartResult) -> Uuid {
        match result {
            StartResult::Suspended { execution_id, .. } => *execution_id,
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expense_approval_suspends_then_completes() {
        let rt = runtime();
        let chain = expense_chain();

        let result = rt
            .start(&chain, json!({ "amount": 700, "employeeId": "e1" }))
            .await
            .unwrap();
        match &result {
            StartResult::Suspended { step_id, reason, .. } => {
                assert_eq!(step_id, "check-approval");
                assert_eq!(reason, "manager approval required");
            }
            other => panic!("expected suspension, got {other:?}"),
        }
        let id = result.execution_id();
        let status = rt.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, ExecutionStatus::Suspended);
        assert_eq!(status.last_known_step_id.as_deref(), Some("check-approval"));

        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.step_index, 0);
        assert_eq!(stored.record.data_snapshot, json!({ "amount": 700, "employeeId": "e1" }));
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("check-approval"));

        let resumed = rt
            .resume(
                id,
                json!({ "approved": true, "managerId": "m1", "adjustedAmount": 650 }),
            )
            .await
            .unwrap();
        assert_eq!(
            resumed.result(),
            Some(&json!({ "status": "approved", "approvedBy": "m1", "finalAmount": 650 }))
        );
        let status = rt.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, ExecutionStatus::Completed);
        assert_eq!(status.last_known_step_id.as_deref(), Some("finalize"));

        let small = rt.start(&chain, json!({ "amount": 100 })).await.unwrap();
        assert_eq!(
            small.result(),
            Some(&json!({ "status": "approved", "approvedBy": "system", "finalAmount": 100 }))
        );
    }

    #[tokio::test]
    async fn start_rejects_invalid_input() {
        let rt = runtime();
        let err = rt
            .start(&expense_chain(), json!({ "amount": "lots", "employeeId": 7 }))
            .await
            .unwrap_err();
        match err {
            StartError::InvalidInput(e) => {
                let paths: Vec<_> = e.violations.iter().map(|v| v.path.as_str()).collect();
                assert!(paths.contains(&"$.amount"));
                assert!(paths.contains(&"$.employeeId"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn completed_steps(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<(String, Value)> {
        let mut steps = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::StepCompleted { step_id, output, .. } = event {
                steps.push((step_id, output));
            }
        }
        steps
    }

    #[tokio::test]
    async fn sequential_chain_is_deterministic() {
        let c = chain(ChainConfig::new("pricing"))
            .and_then(step("subtotal", |ctx| async move {
                let items = ctx.data()["items"].as_array().cloned().unwrap_or_default();
                Ok(json!(items.iter().filter_map(Value::as_f64).sum::<f64>()))
            }))
            .and_map(|v| Ok(json!(v.as_f64().unwrap_or(0.0) * 2.0)))
            .and_when(
                |v| v.as_f64().is_some_and(|n| n > 100.0),
                chain(ChainConfig::new("discount"))
                    .and_map(|v| Ok(json!(v.as_f64().unwrap_or(0.0) - 10.0)))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let input = json!({ "items": [40.0, 60.0, 25.0] });

        let rt = runtime();
        let mut rx = rt.events();
        let first = rt.start(&c, input.clone()).await.unwrap();
        let first_steps = completed_steps(&mut rx);
        let second = rt.start(&c, input).await.unwrap();
        let second_steps = completed_steps(&mut rx);

        assert_eq!(first.result(), second.result());
        assert_eq!(first.result(), Some(&json!(240.0)));
        assert_eq!(first_steps, second_steps);
        let ids: Vec<_> = first_steps.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["subtotal", "map-1", "map-0", "when-2"]);
    }

    /// Branch "gate" pauses when the input asks for it; the resume payload is
    /// ignored so a paused run must end exactly like an unpaused one.
    fn pausable_chain() -> Chain {
        let gate = chain(ChainConfig::new("gate"))
            .and_then(step("gate", |ctx| async move {
                if ctx.data()["pause"] == json!(true) && ctx.resume_data().is_none() {
                    return Err(ctx.suspend("paused"));
                }
                Ok(json!(ctx.data()["n"].as_i64().unwrap_or(0) * 2))
            }))
            .build()
            .unwrap();
        let audit = chain(ChainConfig::new("audit"))
            .and_then(step("audit", |ctx| async move {
                ctx.state().set("audited", json!(true));
                Ok(json!(ctx.data()["n"].as_i64().unwrap_or(0) + 1))
            }))
            .build()
            .unwrap();
        chain(ChainConfig::new("pausable"))
            .and_all([gate, audit])
            .and_then(step("combine", |ctx| async move {
                let parts = ctx.data().as_array().cloned().unwrap_or_default();
                let audited = ctx.state().get("audited").unwrap_or(json!(false));
                Ok(json!({ "parts": parts, "audited": audited, "steps": ctx.history().len() }))
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn suspend_resume_round_trip_matches_straight_run() {
        let rt = runtime();
        let c = pausable_chain();

        let straight = rt.start(&c, json!({ "n": 5, "pause": false })).await.unwrap();

        let paused = rt.start(&c, json!({ "n": 5, "pause": true })).await.unwrap();
        let id = suspended_id(&paused);
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.leaf_step_id, "gate");
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("all-0/0/gate"));
        let resumed = rt.resume(id, json!("go")).await.unwrap();

        assert_eq!(
            straight.result(),
            Some(&json!({ "parts": [10, 6], "audited": true, "steps": 3 }))
        );
        assert_eq!(resumed.result(), straight.result());
    }

    #[tokio::test]
    async fn resume_is_single_use() {
        let rt = runtime();
        let c = expense_chain();
        let id = suspended_id(
            &rt.start(&c, json!({ "amount": 900, "employeeId": "e1" }))
                .await
                .unwrap(),
        );
        let payload = json!({ "approved": false, "managerId": "m1" });
        let first = rt.resume(id, payload.clone()).await.unwrap();
        assert_eq!(
            first.result(),
            Some(&json!({ "status": "rejected", "approvedBy": "m1", "finalAmount": 900 }))
        );
        let second = rt.resume(id, payload).await.unwrap_err();
        assert!(matches!(second, ResumeError::AlreadyConsumed(got) if got == id));

        assert!(matches!(
            rt.resume(Uuid::now_v7(), json!(null)).await.unwrap_err(),
            ResumeError::NotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resume_has_one_winner() {
        let rt = Arc::new(runtime());
        let c = expense_chain();
        let id = suspended_id(
            &rt.start(&c, json!({ "amount": 900, "employeeId": "e1" }))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let rt = Arc::clone(&rt);
            handles.push(tokio::spawn(async move {
                rt.resume(id, json!({ "approved": true, "managerId": format!("m{i}") }))
                    .await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => {
                    assert_eq!(result.status(), ExecutionStatus::Completed);
                    wins += 1;
                }
                Err(ResumeError::AlreadyConsumed(_)) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn invalid_payload_leaves_record_intact() {
        let rt = runtime();
        let c = expense_chain();
        let id = suspended_id(
            &rt.start(&c, json!({ "amount": 900, "employeeId": "e1" }))
                .await
                .unwrap(),
        );
        let before = rt.store().peek(&id).await.unwrap().unwrap();

        let err = rt.resume(id, json!({ "approved": "yes" })).await.unwrap_err();
        match err {
            ResumeError::InvalidPayload(e) => {
                assert_eq!(e.target, ValidationTarget::ResumePayload);
                assert!(!e.violations.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        let after = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert!(!after.is_consumed());

        let ok = rt
            .resume(id, json!({ "approved": true, "managerId": "m1" }))
            .await
            .unwrap();
        assert_eq!(ok.status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn for_each_preserves_item_order() {
        let item = chain(ChainConfig::new("item"))
            .and_then(step("double", |ctx| async move {
                let n = ctx.data().as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(n)).await;
                Ok(json!(n * 2))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("each"))
            .and_for_each_with(item, 3)
            .build()
            .unwrap();
        let result = runtime().start(&c, json!([30, 10, 20, 5])).await.unwrap();
        assert_eq!(result.result(), Some(&json!([60, 20, 40, 10])));
    }

    #[tokio::test]
    async fn for_each_resumes_suspended_item() {
        let item = chain(ChainConfig::new("item"))
            .and_then(step("review-item", |ctx| async move {
                let n = ctx.data().as_i64().unwrap_or(0);
                if n < 0 {
                    return match ctx.resume_data() {
                        Some(fixed) => Ok(fixed.clone()),
                        None => Err(ctx.suspend(format!("item {n} needs review"))),
                    };
                }
                Ok(json!(n))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("each"))
            .and_for_each_with(item, 2)
            .build()
            .unwrap();
        let rt = runtime();
        let started = rt.start(&c, json!([1, 2, -3, 4])).await.unwrap();
        let id = suspended_id(&started);
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("for-each-0/2/review-item"));

        let done = rt.resume(id, json!(3)).await.unwrap();
        assert_eq!(done.result(), Some(&json!([1, 2, 3, 4])));
    }

    #[tokio::test]
    async fn all_failure_wins_over_suspended_sibling() {
        let waits = chain(ChainConfig::new("waits"))
            .and_then(step("wait", |ctx| async move { Err(ctx.suspend("waiting")) }))
            .build()
            .unwrap();
        let breaks = chain(ChainConfig::new("breaks"))
            .and_then(step("break", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(StepError::failed("ledger offline"))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("all")).and_all([waits, breaks]).build().unwrap();

        let rt = runtime();
        let result = rt.start(&c, json!({ "order": 1 })).await.unwrap();
        let id = result.execution_id();
        match result {
            StartResult::Failed { error, .. } => {
                assert_eq!(error.step_id, "break");
                assert_eq!(error.kind, FailureKind::StepFailed);
                assert_eq!(error.branches.len(), 2);
                assert!(matches!(
                    error.branches[0].outcome,
                    stepchain_types::error::BranchOutcome::Suspended { .. }
                ));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(rt.store().peek(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sleep_wakes_when_due() {
        let c = chain(ChainConfig::new("reminder"))
            .and_sleep(Duration::from_secs(3600))
            .and_then(step("remind", |_| async { Ok(json!("sent")) }))
            .build()
            .unwrap();
        let rt = runtime();
        let result = rt.start(&c, json!(null)).await.unwrap();
        let wake_at = match &result {
            StartResult::Suspended { wake_at, step_id, .. } => {
                assert_eq!(step_id, "sleep-0");
                wake_at.unwrap()
            }
            other => panic!("expected suspension, got {other:?}"),
        };

        assert!(rt.wake_due(Utc::now()).await.unwrap().is_empty());

        let woken = rt.wake_due(wake_at + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(woken.len(), 1);
        let (id, outcome) = &woken[0];
        assert_eq!(*id, result.execution_id());
        assert_eq!(outcome.as_ref().unwrap().result(), Some(&json!("sent")));
    }

    #[tokio::test]
    async fn elapsed_sleep_continues_immediately() {
        let c = chain(ChainConfig::new("late"))
            .and_sleep(Utc::now() - chrono::Duration::minutes(5))
            .and_then(step("after", |_| async { Ok(json!("done")) }))
            .build()
            .unwrap();
        let result = runtime().start(&c, json!(null)).await.unwrap();
        assert_eq!(result.result(), Some(&json!("done")));
    }

    /// Waits for `{ "approved": bool }` and passes it on.
    fn approval_branch(step_id: &'static str) -> Chain {
        chain(ChainConfig::new(step_id))
            .and_then(
                step(step_id, |ctx| async move {
                    match ctx.resume_data().cloned() {
                        Some(decision) => Ok(decision),
                        None => Err(ctx.suspend("awaiting approval")),
                    }
                })
                .resume_schema(Shape::object([Field::required("approved", Shape::Bool)])),
            )
            .build()
            .unwrap()
    }

    fn nap_branch() -> Chain {
        chain(ChainConfig::new("nap"))
            .and_sleep(Duration::from_secs(3600))
            .and_map(|_| Ok(json!("slept")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn all_keeps_sleep_pending_after_sibling_resumes() {
        let c = chain(ChainConfig::new("approve-and-nap"))
            .and_all([approval_branch("approve"), nap_branch()])
            .build()
            .unwrap();
        let rt = runtime();
        let started = rt.start(&c, json!({ "order": 7 })).await.unwrap();
        let id = started.execution_id();
        let wake_at = match &started {
            StartResult::Suspended { step_id, wake_at, .. } => {
                assert_eq!(step_id, "approve");
                wake_at.unwrap()
            }
            other => panic!("expected suspension, got {other:?}"),
        };
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.wake_at, Some(wake_at));
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("all-0/0/approve"));

        match rt.resume(id, json!({ "approved": true })).await.unwrap() {
            StartResult::Suspended { step_id, wake_at: pending, .. } => {
                assert_eq!(step_id, "sleep-0");
                assert_eq!(pending, Some(wake_at));
            }
            other => panic!("expected the sleep to stay pending, got {other:?}"),
        }
        assert!(rt.wake_due(Utc::now()).await.unwrap().is_empty());

        let woken = rt.wake_due(wake_at + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(
            woken[0].1.as_ref().unwrap().result(),
            Some(&json!([{ "approved": true }, "slept"]))
        );
    }

    #[tokio::test]
    async fn all_delivers_payload_past_leading_sleep() {
        let c = chain(ChainConfig::new("nap-and-approve"))
            .and_all([nap_branch(), approval_branch("approve")])
            .build()
            .unwrap();
        let rt = runtime();
        let started = rt.start(&c, json!({ "order": 8 })).await.unwrap();
        let id = started.execution_id();
        let wake_at = match &started {
            StartResult::Suspended { step_id, wake_at, .. } => {
                assert_eq!(step_id, "approve");
                wake_at.unwrap()
            }
            other => panic!("expected suspension, got {other:?}"),
        };
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("all-0/1/approve"));

        // Checked against the approval step, not the sleep.
        assert!(matches!(
            rt.resume(id, json!({ "approved": "maybe" })).await.unwrap_err(),
            ResumeError::InvalidPayload(_)
        ));

        match rt.resume(id, json!({ "approved": false })).await.unwrap() {
            StartResult::Suspended { step_id, wake_at: pending, .. } => {
                assert_eq!(step_id, "sleep-0");
                assert_eq!(pending, Some(wake_at));
            }
            other => panic!("expected the sleep to stay pending, got {other:?}"),
        }

        let woken = rt.wake_due(wake_at + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(
            woken[0].1.as_ref().unwrap().result(),
            Some(&json!(["slept", { "approved": false }]))
        );
    }

    #[tokio::test]
    async fn all_resumes_suspended_branches_one_at_a_time() {
        let c = chain(ChainConfig::new("two-signatures"))
            .and_all([approval_branch("approve"), approval_branch("countersign")])
            .build()
            .unwrap();
        let rt = runtime();
        let started = rt.start(&c, json!({ "contract": "c-1" })).await.unwrap();
        match &started {
            StartResult::Suspended { step_id, wake_at, .. } => {
                assert_eq!(step_id, "approve");
                assert!(wake_at.is_none());
            }
            other => panic!("expected suspension, got {other:?}"),
        }
        let id = started.execution_id();

        let first = rt.resume(id, json!({ "approved": true })).await.unwrap();
        match &first {
            StartResult::Suspended { step_id, .. } => assert_eq!(step_id, "countersign"),
            other => panic!("expected the second branch to wait, got {other:?}"),
        }
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("all-0/1/countersign"));

        let done = rt.resume(id, json!({ "approved": false })).await.unwrap();
        assert_eq!(
            done.result(),
            Some(&json!([{ "approved": true }, { "approved": false }]))
        );
    }

    #[tokio::test]
    async fn race_resumes_suspended_winner() {
        let slow = chain(ChainConfig::new("slow"))
            .and_then(step("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("fallback"))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("first-answer"))
            .and_race([approval_branch("approve"), slow])
            .and_then(step("after", |ctx| async move {
                Ok(json!({ "d": ctx.data().clone(), "h": ctx.history().len() }))
            }))
            .build()
            .unwrap();
        let rt = runtime();
        let mut rx = rt.events();

        let id = suspended_id(&rt.start(&c, json!({ "order": 9 })).await.unwrap());
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("race-0/0/approve"));

        let resumed = rt.resume(id, json!({ "approved": true })).await.unwrap();
        assert_eq!(
            resumed.result(),
            Some(&json!({ "d": { "approved": true }, "h": 2 }))
        );
        let ids: Vec<_> = completed_steps(&mut rx).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["approve", "race-0", "after"]);
    }

    #[tokio::test]
    async fn race_adopts_fastest_failure() {
        let slow = chain(ChainConfig::new("cache"))
            .and_then(step("cache", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("cached"))
            }))
            .build()
            .unwrap();
        let broken = chain(ChainConfig::new("registry"))
            .and_then(step("registry", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(StepError::failed("registry offline"))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("lookup"))
            .and_race([slow, broken])
            .build()
            .unwrap();

        let rt = runtime();
        let result = rt.start(&c, json!({ "key": "k" })).await.unwrap();
        let id = result.execution_id();
        match result {
            StartResult::Failed { error, .. } => {
                assert_eq!(error.step_id, "registry");
                assert_eq!(error.kind, FailureKind::StepFailed);
                assert_eq!(error.cause, "registry offline");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            rt.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
    }

    fn guarded_chain() -> Chain {
        chain(ChainConfig::new("publish"))
            .and_guardrail(|v| match v["risk"].as_str() {
                Some("high") => GuardrailVerdict::Block("risk too high".to_string()),
                Some("medium") => GuardrailVerdict::Review("needs a second look".to_string()),
                _ => GuardrailVerdict::Pass,
            })
            .with_id("risk-check")
            .and_then(step("publish", |ctx| async move { Ok(ctx.data()["text"].clone()) }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn guardrail_pass_block_and_review() {
        let rt = runtime();
        let c = guarded_chain();

        let passed = rt.start(&c, json!({ "risk": "low", "text": "hi" })).await.unwrap();
        assert_eq!(passed.result(), Some(&json!("hi")));

        match rt.start(&c, json!({ "risk": "high", "text": "hi" })).await.unwrap() {
            StartResult::Failed { error, .. } => {
                assert_eq!(error.kind, FailureKind::GuardrailBlocked);
                assert_eq!(error.cause, "risk too high");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let held = rt.start(&c, json!({ "risk": "medium", "text": "hi" })).await.unwrap();
        let id = suspended_id(&held);
        assert!(matches!(
            rt.resume(id, json!({ "note": "missing decision" })).await.unwrap_err(),
            ResumeError::InvalidPayload(_)
        ));
        match rt
            .resume(id, json!({ "approved": false, "reviewer": "lee", "note": "tone" }))
            .await
            .unwrap()
        {
            StartResult::Failed { error, .. } => {
                assert_eq!(error.kind, FailureKind::GuardrailRejected);
                assert_eq!(error.cause, "rejected by reviewer 'lee': tone");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let held = rt.start(&c, json!({ "risk": "medium", "text": "ok" })).await.unwrap();
        let approved = rt
            .resume(suspended_id(&held), json!({ "approved": true }))
            .await
            .unwrap();
        assert_eq!(approved.result(), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn cancel_suspended_execution_is_final() {
        let rt = runtime();
        let c = expense_chain();
        let id = suspended_id(
            &rt.start(&c, json!({ "amount": 900, "employeeId": "e1" }))
                .await
                .unwrap(),
        );
        assert!(rt.cancel(id).await.unwrap());
        assert_eq!(
            rt.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(matches!(
            rt.resume(id, json!({ "approved": true, "managerId": "m1" }))
                .await
                .unwrap_err(),
            ResumeError::AlreadyConsumed(_)
        ));
        assert!(!rt.cancel(id).await.unwrap());
        assert!(!rt.cancel(Uuid::now_v7()).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_after_completion_changes_nothing() {
        let rt = runtime();
        let done = rt.start(&expense_chain(), json!({ "amount": 120 })).await.unwrap();
        let id = done.execution_id();
        assert!(!rt.cancel(id).await.unwrap());
        assert_eq!(
            rt.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_running_execution() {
        let rt = Arc::new(runtime());
        let c = chain(ChainConfig::new("long"))
            .and_then(step("wait-for-cancel", |ctx| async move {
                tokio::select! {
                    _ = ctx.cancelled() => Err(StepError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!("too late")),
                }
            }))
            .and_then(step("never", |_| async { Ok(json!("unreachable")) }))
            .build()
            .unwrap();

        let mut rx = rt.events();
        let handle = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move { rt.start(&c, json!(null)).await })
        };
        let id = loop {
            if let WorkflowEvent::ExecutionStarted { execution_id, .. } = rx.recv().await.unwrap() {
                break execution_id;
            }
        };
        assert_eq!(
            rt.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Running
        );
        assert!(rt.cancel(id).await.unwrap());

        match handle.await.unwrap().unwrap() {
            StartResult::Cancelled { error, .. } => {
                assert_eq!(error.step_id.as_deref(), Some("wait-for-cancel"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(
            rt.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn loop_resumes_inside_iteration() {
        let body = chain(ChainConfig::new("round"))
            .and_then(step("round", |ctx| async move {
                let n = ctx.data().as_i64().unwrap_or(0);
                if n == 1 && ctx.resume_data().is_none() {
                    return Err(ctx.suspend("checkpoint"));
                }
                Ok(json!(n + 1))
            }))
            .build()
            .unwrap();
        let c = chain(ChainConfig::new("rounds"))
            .and_do_until(|v| v.as_i64().is_some_and(|n| n >= 3), body)
            .build()
            .unwrap();
        let rt = runtime();
        let id = suspended_id(&rt.start(&c, json!(0)).await.unwrap());
        let stored = rt.store().peek(&id).await.unwrap().unwrap();
        assert_eq!(stored.record.resume_schema_ref.as_deref(), Some("loop-0/1/round"));

        let done = rt.resume(id, json!(true)).await.unwrap();
        assert_eq!(done.result(), Some(&json!(3)));
    }

    #[tokio::test]
    async fn resume_requires_registered_matching_chain() {
        let store = Arc::new(InMemorySuspensionStore::new());
        let rt = WorkflowRuntime::new(Arc::clone(&store), EngineConfig::default());
        let id = suspended_id(
            &rt.start(&expense_chain(), json!({ "amount": 900, "employeeId": "e1" }))
                .await
                .unwrap(),
        );

        let other = WorkflowRuntime::new(Arc::clone(&store), EngineConfig::default());
        assert!(matches!(
            other.resume(id, json!({ "approved": true, "managerId": "x" })).await.unwrap_err(),
            ResumeError::UnknownChain(chain_id) if chain_id == "expense-approval"
        ));

        let renamed = chain(ChainConfig::new("expense-approval"))
            .and_then(step("new-check", |ctx| async move { Ok(ctx.data().clone()) }))
            .build()
            .unwrap();
        other.register(&renamed);
        assert!(matches!(
            other.resume(id, json!({ "approved": true, "managerId": "x" })).await.unwrap_err(),
            ResumeError::StaleRecord { .. }
        ));

        // Nothing was consumed along the way.
        let ok = rt
            .resume(id, json!({ "approved": true, "managerId": "m1" }))
            .await
            .unwrap();
        assert_eq!(ok.status(), ExecutionStatus::Completed);
        assert_eq!(
            other.status(id).await.unwrap().unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn result_schema_violation_fails_execution() {
        let c = chain(ChainConfig::new("result").result_schema(Shape::String))
            .and_then(step("produce", |_| async { Ok(json!(42)) }))
            .build()
            .unwrap();
        match runtime().start(&c, json!(null)).await.unwrap() {
            StartResult::Failed { error, .. } => {
                assert_eq!(error.kind, FailureKind::ResultValidation);
                assert_eq!(error.step_id, "produce");
                assert_eq!(error.data, json!(42));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_and_lifecycle_events() {
        let c = chain(ChainConfig::new("draft"))
            .and_then(step("draft", |ctx| async move {
                ctx.progress(json!("Dear"));
                ctx.progress(json!("Dear team"));
                Ok(json!("Dear team,"))
            }))
            .build()
            .unwrap();
        let rt = runtime();
        let mut rx = rt.events();
        rt.start(&c, json!(null)).await.unwrap();

        let mut kinds = Vec::new();
        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::StepProgress { value, .. } = &event {
                progress.push(value.clone());
            }
            let kind = serde_json::to_value(&event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string();
            kinds.push(kind);
        }
        assert_eq!(progress, vec![json!("Dear"), json!("Dear team")]);
        assert_eq!(
            kinds,
            [
                "execution_started",
                "step_started",
                "step_progress",
                "step_progress",
                "step_completed",
                "execution_completed",
            ]
        );
    }
}
