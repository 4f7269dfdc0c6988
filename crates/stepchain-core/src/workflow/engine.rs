//! Chain interpreter.
//!
//! Runs the steps of a chain against an `ExecutionContext`, including the
//! combinators, and produces a `ChainOutcome`. On suspension the outcome
//! carries a `ChainCursor` that addresses the paused step down through any
//! nesting, so a later run can re-enter at exactly that point.
//!
//! Parallel branches run as tokio tasks on a `JoinSet`. Race losers are
//! fenced off the shared workflow state and signalled through child
//! cancellation tokens before their tasks are detached.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepchain_types::config::EngineConfig;
use stepchain_types::error::{
    BranchDiagnostic, BranchOutcome, CancellationError, FailureKind, StepExecutionError,
    ValidationTarget,
};
use stepchain_types::event::WorkflowEvent;
use stepchain_types::execution::{BranchSlot, ChainCursor, HistoryEntry, StepCursor};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, debug_span, warn};

use super::chain::Chain;
use super::context::ExecutionContext;
use super::cursor::{awaits_input, branch_body, payload_target};
use super::delegate::DelegateRequest;
use super::error::StepError;
use super::step::{GuardrailVerdict, LoopMode, ReviewDecision, SleepSpec, Step, StepKind};
use crate::schema::{check, check_optional};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where a run re-enters a chain, and the payload for the paused leaf.
#[derive(Debug)]
pub(crate) struct Resume {
    pub cursor: ChainCursor,
    pub payload: Option<Value>,
}

/// The innermost step that paused, with the path leading to it.
///
/// `path` lists step ids and branch, case or iteration indices from the
/// top-level step down to the leaf.
#[derive(Debug, Clone)]
pub(crate) struct SuspendPoint {
    pub step_id: String,
    pub path: Vec<String>,
    pub reason: String,
    pub payload: Option<Value>,
}

impl SuspendPoint {
    fn leaf(step_id: &str, reason: String, payload: Option<Value>) -> Self {
        Self {
            step_id: step_id.to_string(),
            path: Vec::new(),
            reason,
            payload,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ChainOutcome {
    Completed(Value),
    Suspended {
        cursor: ChainCursor,
        point: SuspendPoint,
    },
    Failed(StepExecutionError),
    Cancelled(CancellationError),
}

enum StepOutcome {
    Continue(Value),
    Suspend {
        inner: Option<StepCursor>,
        point: SuspendPoint,
    },
    Fail(StepExecutionError),
    Cancel(CancellationError),
}

/// Resume position for a single step.
struct StepResume {
    inner: Option<StepCursor>,
    payload: Option<Value>,
}

/// Result of running leaf code under the timeout and panic guard.
enum LeafRun<T> {
    Done(Result<T, StepError>),
    TimedOut,
    Panicked(String),
}

impl<T> LeafRun<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> LeafRun<U> {
        match self {
            LeafRun::Done(result) => LeafRun::Done(result.map(f)),
            LeafRun::TimedOut => LeafRun::TimedOut,
            LeafRun::Panicked(msg) => LeafRun::Panicked(msg),
        }
    }
}

/// One branch handed to `fan_out`.
struct Job {
    chain: Chain,
    input: Value,
    prior: Option<BranchSlot>,
}

/// How a branch settled, with the history it appended.
enum Settled {
    Completed {
        output: Value,
        history: Vec<HistoryEntry>,
    },
    Suspended {
        cursor: ChainCursor,
        point: SuspendPoint,
        history: Vec<HistoryEntry>,
    },
    Failed(StepExecutionError),
    Cancelled(CancellationError),
}

impl Settled {
    fn diagnostic(&self) -> BranchOutcome {
        match self {
            Settled::Completed { output, .. } => BranchOutcome::Completed {
                output: output.clone(),
            },
            Settled::Suspended { point, .. } => BranchOutcome::Suspended {
                step_id: point.step_id.clone(),
                reason: point.reason.clone(),
            },
            Settled::Failed(e) => BranchOutcome::Failed {
                step_id: e.step_id.clone(),
                cause: e.cause.clone(),
            },
            Settled::Cancelled(_) => BranchOutcome::Cancelled,
        }
    }
}

enum Gathered {
    Done(Vec<Value>),
    Suspended {
        slots: Vec<BranchSlot>,
        point: SuspendPoint,
    },
    Failed(StepExecutionError),
    Cancelled(CancellationError),
}

type BranchResult = (
    usize,
    Result<ChainOutcome, Box<dyn Any + Send>>,
    Vec<HistoryEntry>,
);

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Interprets chains. Cheap to clone; clones share configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner { config }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run `chain` from its first step, or from `resume` when given.
    pub(crate) fn run_chain<'a>(
        &'a self,
        chain: &'a Chain,
        ctx: &'a mut ExecutionContext,
        resume: Option<Resume>,
    ) -> BoxFuture<'a, ChainOutcome> {
        async move {
            let mut resume = resume;
            let start = match &resume {
                None => 0,
                Some(r) => {
                    let matches = chain
                        .step(r.cursor.step_index)
                        .is_some_and(|step| step.id() == r.cursor.step_id);
                    if !matches {
                        return ChainOutcome::Failed(StepExecutionError::new(
                            r.cursor.step_id.clone(),
                            FailureKind::StaleCursor,
                            format!(
                                "chain '{}' has no step '{}' at index {}",
                                chain.id(),
                                r.cursor.step_id,
                                r.cursor.step_index
                            ),
                            r.cursor.data.clone(),
                        ));
                    }
                    ctx.data = r.cursor.data.clone();
                    r.cursor.step_index
                }
            };

            for (index, step) in chain.steps().iter().enumerate().skip(start) {
                if ctx.cancel.is_cancelled() {
                    debug!(execution_id = %ctx.execution_id, step_id = step.id(), "cancel observed");
                    return ChainOutcome::Cancelled(CancellationError {
                        step_id: Some(step.id().to_string()),
                    });
                }

                let entry = ctx.data.clone();
                let step_resume = resume.take().map(|r| StepResume {
                    inner: r.cursor.inner.map(|inner| *inner),
                    payload: r.payload,
                });

                ctx.events().publish(WorkflowEvent::StepStarted {
                    execution_id: ctx.execution_id,
                    step_id: step.id().to_string(),
                    kind: step.kind_name().to_string(),
                });
                debug!(
                    execution_id = %ctx.execution_id,
                    chain_id = chain.id(),
                    step_id = step.id(),
                    kind = step.kind_name(),
                    resuming = step_resume.is_some(),
                    "step started"
                );
                let started = Instant::now();

                let span = debug_span!("stepchain.step", step_id = step.id(), kind = step.kind_name());
                match self.run_step(step, ctx, step_resume).instrument(span).await {
                    StepOutcome::Continue(output) => {
                        ctx.events().publish(WorkflowEvent::StepCompleted {
                            execution_id: ctx.execution_id,
                            step_id: step.id().to_string(),
                            output: output.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                        });
                        ctx.history.push(HistoryEntry {
                            step_id: step.id().to_string(),
                            output: output.clone(),
                        });
                        ctx.data = output;
                    }
                    StepOutcome::Suspend { inner, mut point } => {
                        debug!(
                            execution_id = %ctx.execution_id,
                            step_id = step.id(),
                            leaf = %point.step_id,
                            reason = %point.reason,
                            "step suspended"
                        );
                        point.path.insert(0, step.id().to_string());
                        return ChainOutcome::Suspended {
                            cursor: ChainCursor {
                                step_index: index,
                                step_id: step.id().to_string(),
                                data: entry,
                                inner: inner.map(Box::new),
                            },
                            point,
                        };
                    }
                    StepOutcome::Fail(error) => {
                        debug!(
                            execution_id = %ctx.execution_id,
                            step_id = step.id(),
                            error = %error,
                            "step failed"
                        );
                        ctx.events().publish(WorkflowEvent::StepFailed {
                            execution_id: ctx.execution_id,
                            step_id: error.step_id.clone(),
                            error: error.to_string(),
                        });
                        return ChainOutcome::Failed(error);
                    }
                    StepOutcome::Cancel(error) => return ChainOutcome::Cancelled(error),
                }
            }

            ChainOutcome::Completed(ctx.data.clone())
        }
        .boxed()
    }

    /// Run one step with its input and output schema checks.
    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        resume: Option<StepResume>,
    ) -> StepOutcome {
        // A resumed step already passed its input check before suspending.
        if resume.is_none() {
            if let Err(e) = check_optional(step.input_schema(), ValidationTarget::StepInput, &ctx.data) {
                return StepOutcome::Fail(StepExecutionError::from_validation(
                    step.id(),
                    FailureKind::InvalidInput,
                    e,
                    ctx.data.clone(),
                ));
            }
        }

        match self.dispatch(step, ctx, resume).await {
            StepOutcome::Continue(output) => {
                match check_optional(step.output_schema(), ValidationTarget::StepOutput, &output) {
                    Ok(()) => StepOutcome::Continue(output),
                    Err(e) => StepOutcome::Fail(StepExecutionError::from_validation(
                        step.id(),
                        FailureKind::InvalidOutput,
                        e,
                        ctx.data.clone(),
                    )),
                }
            }
            other => other,
        }
    }

    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        resume: Option<StepResume>,
    ) -> StepOutcome {
        match &step.kind {
            StepKind::Then(run) => {
                let payload = match leaf_resume(step, ctx, resume) {
                    Ok(payload) => payload,
                    Err(outcome) => return outcome,
                };
                let step_ctx = ctx.step_context(step.id(), payload);
                let run = Arc::clone(run);
                let result = self.guarded(async move { run(step_ctx).await }).await;
                settle_leaf(step, ctx, result)
            }

            StepKind::Tap(run) => {
                let payload = match leaf_resume(step, ctx, resume) {
                    Ok(payload) => payload,
                    Err(outcome) => return outcome,
                };
                let step_ctx = ctx.step_context(step.id(), payload);
                let run = Arc::clone(run);
                let data = ctx.data.clone();
                let result = self
                    .guarded(async move { run(step_ctx).await })
                    .await
                    .map(|()| data);
                settle_leaf(step, ctx, result)
            }

            StepKind::Map(f) => {
                if let Err(outcome) = leaf_resume(step, ctx, resume) {
                    return outcome;
                }
                match call_sync(step, ctx, || f(ctx.data.clone())) {
                    Ok(result) => settle_leaf(step, ctx, LeafRun::Done(result)),
                    Err(outcome) => outcome,
                }
            }

            StepKind::Agent(spec) => {
                if let Err(outcome) = leaf_resume(step, ctx, resume) {
                    return outcome;
                }
                if ctx.cancel.is_cancelled() {
                    return cancelled(step);
                }
                let prompt = match call_sync(step, ctx, || (spec.prompt)(&ctx.data)) {
                    Ok(prompt) => prompt,
                    Err(outcome) => return outcome,
                };
                let request = DelegateRequest {
                    step_id: step.id().to_string(),
                    prompt,
                    output_shape: spec.output_schema.shape(),
                };
                let delegate = spec.delegate.clone();
                debug!(step_id = step.id(), delegate = delegate.name(), "invoking delegate");
                let result = self
                    .guarded(async move {
                        delegate
                            .invoke(&request)
                            .await
                            .map_err(|e| StepError::Failed(e.to_string()))
                    })
                    .await;
                if ctx.cancel.is_cancelled() {
                    return cancelled(step);
                }

                let output = match result {
                    LeafRun::Done(Ok(output)) => output,
                    LeafRun::Done(Err(e)) => {
                        return fail(step, ctx, FailureKind::Delegate, e.to_string());
                    }
                    other => return settle_leaf(step, ctx, other),
                };
                if let Err(e) = check(
                    spec.output_schema.as_ref(),
                    ValidationTarget::DelegateOutput,
                    &output,
                ) {
                    return StepOutcome::Fail(StepExecutionError::from_validation(
                        step.id(),
                        FailureKind::Delegate,
                        e,
                        ctx.data.clone(),
                    ));
                }
                match &spec.mapper {
                    None => StepOutcome::Continue(output),
                    Some(mapper) => {
                        let step_ctx = ctx.step_context(step.id(), None);
                        match call_sync(step, ctx, || mapper(output, &step_ctx)) {
                            Ok(result) => settle_leaf(step, ctx, LeafRun::Done(result)),
                            Err(outcome) => outcome,
                        }
                    }
                }
            }

            StepKind::When { predicate, chain } => {
                let inner_resume = match resume {
                    None => None,
                    Some(StepResume {
                        inner: Some(StepCursor::Splice { case: 0, cursor }),
                        payload,
                    }) => Some(Resume { cursor, payload }),
                    Some(_) => return stale(step, ctx, "expected a when position"),
                };
                // The predicate is evaluated once; a resumed splice is not re-decided.
                if inner_resume.is_none() {
                    match call_sync(step, ctx, || predicate(&ctx.data)) {
                        Ok(true) => {}
                        Ok(false) => return StepOutcome::Continue(ctx.data.clone()),
                        Err(outcome) => return outcome,
                    }
                }
                self.splice(0, chain, ctx, inner_resume).await
            }

            StepKind::Branch { cases, default } => {
                let (case, inner_resume) = match resume {
                    None => {
                        let mut chosen = None;
                        for (i, c) in cases.iter().enumerate() {
                            match call_sync(step, ctx, || (c.predicate)(&ctx.data)) {
                                Ok(true) => {
                                    chosen = Some(i);
                                    break;
                                }
                                Ok(false) => {}
                                Err(outcome) => return outcome,
                            }
                        }
                        match chosen.or(default.as_ref().map(|_| cases.len())) {
                            Some(case) => (case, None),
                            None => {
                                return fail(
                                    step,
                                    ctx,
                                    FailureKind::NoBranchMatched,
                                    "no case matched and no default chain is declared",
                                );
                            }
                        }
                    }
                    Some(StepResume {
                        inner: Some(StepCursor::Splice { case, cursor }),
                        payload,
                    }) => (case, Some(Resume { cursor, payload })),
                    Some(_) => return stale(step, ctx, "expected a branch position"),
                };
                let Some(body) = branch_body(cases, default.as_ref(), case) else {
                    return stale(step, ctx, "case index out of range");
                };
                debug!(step_id = step.id(), case, "branch selected");
                self.splice(case, body, ctx, inner_resume).await
            }

            StepKind::All(branches) => {
                let (prior, payload) = match resume {
                    None => (vec![None; branches.len()], None),
                    Some(StepResume {
                        inner: Some(StepCursor::Fanout { slots }),
                        payload,
                    }) if slots.len() == branches.len() => {
                        (slots.into_iter().map(Some).collect(), payload)
                    }
                    Some(_) => return stale(step, ctx, "expected one slot per branch"),
                };
                let jobs = branches
                    .iter()
                    .zip(prior)
                    .map(|(chain, prior)| Job {
                        chain: chain.clone(),
                        input: ctx.data.clone(),
                        prior,
                    })
                    .collect();
                let (settled, first_failure) = self.fan_out(step, ctx, jobs, payload).await;
                match gather(ctx, settled, first_failure, 0) {
                    Gathered::Done(outputs) => StepOutcome::Continue(Value::Array(outputs)),
                    Gathered::Suspended { slots, point } => StepOutcome::Suspend {
                        inner: Some(StepCursor::Fanout { slots }),
                        point,
                    },
                    Gathered::Failed(e) => StepOutcome::Fail(e),
                    Gathered::Cancelled(e) => StepOutcome::Cancel(e),
                }
            }

            StepKind::Race(branches) => match resume {
                None => self.race(step, branches, ctx).await,
                Some(StepResume {
                    inner: Some(StepCursor::Race { branch, cursor, history }),
                    payload,
                }) => {
                    let Some(body) = branches.get(branch) else {
                        return stale(step, ctx, "race branch out of range");
                    };
                    // Only the adopted branch is revived; the losers are gone.
                    let mut branch_ctx = ctx.fork(
                        cursor.data.clone(),
                        ctx.cancel.clone(),
                        ctx.state.clone(),
                        history,
                    );
                    let outcome = self
                        .run_chain(body, &mut branch_ctx, Some(Resume { cursor, payload }))
                        .await;
                    adopt(branch, outcome, branch_ctx.into_own_history(), ctx)
                }
                Some(_) => stale(step, ctx, "expected a race position"),
            },

            StepKind::ForEach { chain, concurrency } => {
                self.for_each(step, chain, *concurrency, ctx, resume).await
            }

            StepKind::Loop {
                mode,
                condition,
                body,
            } => {
                let (mut iteration, mut pending) = match resume {
                    None => (0u64, None),
                    Some(StepResume {
                        inner: Some(StepCursor::Loop { iteration, cursor }),
                        payload,
                    }) => (iteration, Some(Resume { cursor, payload })),
                    Some(_) => return stale(step, ctx, "expected a loop position"),
                };
                loop {
                    if pending.is_none() {
                        if ctx.cancel.is_cancelled() {
                            return cancelled(step);
                        }
                        if *mode == LoopMode::While {
                            match call_sync(step, ctx, || condition(&ctx.data)) {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(outcome) => return outcome,
                            }
                        }
                    }
                    match self.run_chain(body, ctx, pending.take()).await {
                        ChainOutcome::Completed(_) => {}
                        ChainOutcome::Suspended { cursor, mut point } => {
                            point.path.insert(0, iteration.to_string());
                            return StepOutcome::Suspend {
                                inner: Some(StepCursor::Loop { iteration, cursor }),
                                point,
                            };
                        }
                        ChainOutcome::Failed(e) => return StepOutcome::Fail(e),
                        ChainOutcome::Cancelled(e) => return StepOutcome::Cancel(e),
                    }
                    iteration += 1;
                    let stop = match mode {
                        LoopMode::While => false,
                        LoopMode::DoWhile => match call_sync(step, ctx, || condition(&ctx.data)) {
                            Ok(holds) => !holds,
                            Err(outcome) => return outcome,
                        },
                        LoopMode::DoUntil => match call_sync(step, ctx, || condition(&ctx.data)) {
                            Ok(holds) => holds,
                            Err(outcome) => return outcome,
                        },
                    };
                    if stop {
                        break;
                    }
                }
                debug!(step_id = step.id(), iterations = iteration, "loop finished");
                StepOutcome::Continue(ctx.data.clone())
            }

            StepKind::Guardrail(verdict) => {
                let payload = match leaf_resume(step, ctx, resume) {
                    Ok(payload) => payload,
                    Err(outcome) => return outcome,
                };
                if let Some(payload) = payload {
                    let decision: ReviewDecision = match serde_json::from_value(payload) {
                        Ok(decision) => decision,
                        Err(e) => return fail(step, ctx, FailureKind::StepFailed, e.to_string()),
                    };
                    if decision.approved {
                        return StepOutcome::Continue(ctx.data.clone());
                    }
                    let mut cause = String::from("rejected by reviewer");
                    if let Some(reviewer) = &decision.reviewer {
                        cause.push_str(&format!(" '{reviewer}'"));
                    }
                    if let Some(note) = &decision.note {
                        cause.push_str(&format!(": {note}"));
                    }
                    return fail(step, ctx, FailureKind::GuardrailRejected, cause);
                }
                match call_sync(step, ctx, || verdict(&ctx.data)) {
                    Ok(GuardrailVerdict::Pass) => StepOutcome::Continue(ctx.data.clone()),
                    Ok(GuardrailVerdict::Block(reason)) => {
                        fail(step, ctx, FailureKind::GuardrailBlocked, reason)
                    }
                    Ok(GuardrailVerdict::Review(reason)) => StepOutcome::Suspend {
                        inner: None,
                        point: SuspendPoint::leaf(step.id(), reason, None),
                    },
                    Err(outcome) => outcome,
                }
            }

            StepKind::Sleep(spec) => match resume {
                None => {
                    let now = ctx.now();
                    let wake_at = match spec {
                        SleepSpec::Until(at) => *at,
                        SleepSpec::For(duration) => match chrono::Duration::from_std(*duration)
                            .ok()
                            .and_then(|d| now.checked_add_signed(d))
                        {
                            Some(at) => at,
                            None => {
                                return fail(
                                    step,
                                    ctx,
                                    FailureKind::StepFailed,
                                    "sleep duration is out of range",
                                );
                            }
                        },
                    };
                    if wake_at <= now {
                        return StepOutcome::Continue(ctx.data.clone());
                    }
                    sleeping(step, wake_at)
                }
                Some(StepResume {
                    inner: Some(StepCursor::Sleep { wake_at }),
                    payload,
                }) => {
                    if ctx.now() >= wake_at {
                        return StepOutcome::Continue(ctx.data.clone());
                    }
                    // Only an explicit resume wakes a sleep early. A sibling's
                    // resume re-enters it without a payload.
                    if payload.is_none() {
                        return sleeping(step, wake_at);
                    }
                    debug!(step_id = step.id(), %wake_at, "sleep resumed before its wake time");
                    StepOutcome::Continue(ctx.data.clone())
                }
                Some(_) => stale(step, ctx, "expected a sleep position"),
            },
        }
    }

    /// Run the chain spliced in by `and_when` or `and_branch`.
    async fn splice(
        &self,
        case: usize,
        body: &Chain,
        ctx: &mut ExecutionContext,
        resume: Option<Resume>,
    ) -> StepOutcome {
        match self.run_chain(body, ctx, resume).await {
            ChainOutcome::Completed(output) => StepOutcome::Continue(output),
            ChainOutcome::Suspended { cursor, mut point } => {
                point.path.insert(0, case.to_string());
                StepOutcome::Suspend {
                    inner: Some(StepCursor::Splice { case, cursor }),
                    point,
                }
            }
            ChainOutcome::Failed(e) => StepOutcome::Fail(e),
            ChainOutcome::Cancelled(e) => StepOutcome::Cancel(e),
        }
    }

    /// Process an array in windows of `concurrency` items. Each window runs
    /// as a fan-out; outputs keep item order.
    async fn for_each(
        &self,
        step: &Step,
        item: &Chain,
        concurrency: Option<usize>,
        ctx: &mut ExecutionContext,
        resume: Option<StepResume>,
    ) -> StepOutcome {
        let window = concurrency
            .unwrap_or(self.inner.config.default_for_each_concurrency)
            .max(1);

        let (items, mut start, mut outputs, mut prior, mut payload) = match resume {
            None => match &ctx.data {
                Value::Array(items) => (items.clone(), 0, Vec::new(), None, None),
                other => {
                    let cause = format!("expected an array, got {}", json_kind(other));
                    return fail(step, ctx, FailureKind::NotASequence, cause);
                }
            },
            Some(StepResume {
                inner:
                    Some(StepCursor::ForEach {
                        items,
                        start,
                        outputs,
                        slots,
                    }),
                payload,
            }) => (items, start, outputs, Some(slots), payload),
            Some(_) => return stale(step, ctx, "expected a for-each position"),
        };

        while start < items.len() {
            if ctx.cancel.is_cancelled() {
                return cancelled(step);
            }
            let jobs: Vec<Job> = match prior.take() {
                Some(slots) => slots
                    .into_iter()
                    .enumerate()
                    .map(|(k, slot)| Job {
                        chain: item.clone(),
                        input: items.get(start + k).cloned().unwrap_or_default(),
                        prior: Some(slot),
                    })
                    .collect(),
                None => items[start..(start + window).min(items.len())]
                    .iter()
                    .map(|input| Job {
                        chain: item.clone(),
                        input: input.clone(),
                        prior: None,
                    })
                    .collect(),
            };
            let width = jobs.len();
            if width == 0 {
                return stale(step, ctx, "empty for-each window");
            }

            let (settled, first_failure) = self.fan_out(step, ctx, jobs, payload.take()).await;
            match gather(ctx, settled, first_failure, start) {
                Gathered::Done(window_outputs) => outputs.extend(window_outputs),
                Gathered::Suspended { slots, point } => {
                    return StepOutcome::Suspend {
                        inner: Some(StepCursor::ForEach {
                            items,
                            start,
                            outputs,
                            slots,
                        }),
                        point,
                    };
                }
                Gathered::Failed(e) => return StepOutcome::Fail(e),
                Gathered::Cancelled(e) => return StepOutcome::Cancel(e),
            }
            start += width;
        }
        StepOutcome::Continue(Value::Array(outputs))
    }

    /// Run branches concurrently and wait for all of them.
    ///
    /// Slots that completed in an earlier run are taken from the cache.
    /// The resume payload goes to the first suspended slot that awaits
    /// input, or the first suspended slot when all of them are sleeping.
    /// Returns every branch's settlement in branch order, plus the index of
    /// the first failure in completion order.
    async fn fan_out(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        jobs: Vec<Job>,
        mut payload: Option<Value>,
    ) -> (Vec<Settled>, Option<usize>) {
        let mut results: Vec<Option<Settled>> = jobs.iter().map(|_| None).collect();
        let mut join_set: JoinSet<BranchResult> = JoinSet::new();
        let suspended = jobs.iter().enumerate().filter_map(|(i, job)| match &job.prior {
            Some(BranchSlot::Suspended { cursor, .. }) => Some((i, cursor)),
            _ => None,
        });
        let target = payload_target(suspended).map(|(i, _)| i);

        for (index, job) in jobs.into_iter().enumerate() {
            let (input, resume, own_history) = match job.prior {
                Some(BranchSlot::Completed { output, history }) => {
                    results[index] = Some(Settled::Completed { output, history });
                    continue;
                }
                Some(BranchSlot::Suspended { cursor, history, .. }) => {
                    let data = cursor.data.clone();
                    let payload = if target == Some(index) { payload.take() } else { None };
                    let resume = Resume { cursor, payload };
                    (data, Some(resume), history)
                }
                None => (job.input, None, Vec::new()),
            };
            let mut branch_ctx = ctx.fork(input, ctx.cancel.clone(), ctx.state.clone(), own_history);
            let engine = self.clone();
            let chain = job.chain;
            join_set.spawn(async move {
                let outcome = AssertUnwindSafe(engine.run_chain(&chain, &mut branch_ctx, resume))
                    .catch_unwind()
                    .await;
                (index, outcome, branch_ctx.into_own_history())
            });
        }

        let mut first_failure = None;
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome, history) = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(step_id = step.id(), error = %err, "branch task did not complete");
                    continue;
                }
            };
            let settled = match outcome {
                Ok(ChainOutcome::Completed(output)) => Settled::Completed { output, history },
                Ok(ChainOutcome::Suspended { cursor, point }) => Settled::Suspended {
                    cursor,
                    point,
                    history,
                },
                Ok(ChainOutcome::Failed(e)) => Settled::Failed(e),
                Ok(ChainOutcome::Cancelled(e)) => Settled::Cancelled(e),
                Err(panic) => Settled::Failed(StepExecutionError::new(
                    step.id(),
                    FailureKind::TaskPanicked,
                    panic_message(panic.as_ref()),
                    ctx.data.clone(),
                )),
            };
            if matches!(settled, Settled::Failed(_)) && first_failure.is_none() {
                first_failure = Some(index);
            }
            results[index] = Some(settled);
        }

        let settled = results
            .into_iter()
            .map(|r| r.unwrap_or(Settled::Cancelled(CancellationError { step_id: None })))
            .collect();
        (settled, first_failure)
    }

    /// Run every branch; the first branch to settle in any state decides.
    async fn race(&self, step: &Step, branches: &[Chain], ctx: &mut ExecutionContext) -> StepOutcome {
        let mut join_set: JoinSet<BranchResult> = JoinSet::new();
        let mut tokens = Vec::with_capacity(branches.len());
        let mut fences = Vec::with_capacity(branches.len());

        for (index, body) in branches.iter().enumerate() {
            let token = ctx.cancel.child_token();
            let fence = Arc::new(AtomicBool::new(false));
            let mut branch_ctx = ctx.fork(
                ctx.data.clone(),
                token.clone(),
                ctx.state.fenced(Arc::clone(&fence)),
                Vec::new(),
            );
            tokens.push(token);
            fences.push(fence);
            let engine = self.clone();
            let body = body.clone();
            join_set.spawn(async move {
                let outcome = AssertUnwindSafe(engine.run_chain(&body, &mut branch_ctx, None))
                    .catch_unwind()
                    .await;
                (index, outcome, branch_ctx.into_own_history())
            });
        }

        let mut winner = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    winner = Some(result);
                    break;
                }
                Err(err) => warn!(step_id = step.id(), error = %err, "race branch did not complete"),
            }
        }
        let Some((index, outcome, history)) = winner else {
            return fail(step, ctx, FailureKind::TaskPanicked, "no race branch settled");
        };

        let losers: Vec<Arc<AtomicBool>> = fences
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, fence)| Arc::clone(fence))
            .collect();
        ctx.state.raise_fences(&losers);
        for (i, token) in tokens.iter().enumerate() {
            if i != index {
                token.cancel();
            }
        }
        join_set.detach_all();
        debug!(step_id = step.id(), winner = index, "race settled");

        match outcome {
            Ok(outcome) => adopt(index, outcome, history, ctx),
            Err(panic) => fail(
                step,
                ctx,
                FailureKind::TaskPanicked,
                panic_message(panic.as_ref()),
            ),
        }
    }

    /// Await leaf code under the step timeout, turning panics into values.
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, StepError>> + Send,
    ) -> LeafRun<T> {
        let fut = AssertUnwindSafe(fut).catch_unwind();
        let result = match self.inner.config.step_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => return LeafRun::TimedOut,
            },
            None => fut.await,
        };
        match result {
            Ok(result) => LeafRun::Done(result),
            Err(panic) => LeafRun::Panicked(panic_message(panic.as_ref())),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map what leaf code returned onto a step outcome.
fn settle_leaf(step: &Step, ctx: &ExecutionContext, run: LeafRun<Value>) -> StepOutcome {
    match run {
        LeafRun::Done(Ok(output)) => StepOutcome::Continue(output),
        LeafRun::Done(Err(StepError::Suspend { reason, payload })) => StepOutcome::Suspend {
            inner: None,
            point: SuspendPoint::leaf(step.id(), reason, payload),
        },
        LeafRun::Done(Err(StepError::Cancelled)) => cancelled(step),
        LeafRun::Done(Err(StepError::Failed(cause))) => {
            fail(step, ctx, FailureKind::StepFailed, cause)
        }
        LeafRun::TimedOut => fail(step, ctx, FailureKind::Timeout, "step exceeded its timeout"),
        LeafRun::Panicked(message) => fail(step, ctx, FailureKind::TaskPanicked, message),
    }
}

/// Merge a parallel run's settlements.
///
/// A failure wins over everything (the first one observed), then a
/// cancellation, then suspension. The reported suspend point is the first
/// slot awaiting input, falling back to the first sleeping slot. Otherwise every branch completed and
/// their histories are appended in branch order.
fn gather(
    ctx: &mut ExecutionContext,
    settled: Vec<Settled>,
    first_failure: Option<usize>,
    offset: usize,
) -> Gathered {
    let diagnostics: Vec<BranchDiagnostic> = settled
        .iter()
        .enumerate()
        .map(|(i, s)| BranchDiagnostic {
            branch: offset + i,
            outcome: s.diagnostic(),
        })
        .collect();

    let mut failed = None;
    let mut cancelled = None;
    let mut point = None;
    let mut slots = Vec::with_capacity(settled.len());
    for (i, s) in settled.into_iter().enumerate() {
        match s {
            Settled::Completed { output, history } => {
                slots.push(BranchSlot::Completed { output, history });
            }
            Settled::Suspended {
                cursor,
                point: mut p,
                history,
            } => {
                let reason = p.reason.clone();
                let waits = awaits_input(&cursor);
                let replaces = match &point {
                    None => true,
                    Some((_, held)) => waits && !held,
                };
                if replaces {
                    p.path.insert(0, (offset + i).to_string());
                    point = Some((p, waits));
                }
                slots.push(BranchSlot::Suspended {
                    cursor,
                    reason,
                    history,
                });
            }
            Settled::Failed(e) => {
                if first_failure == Some(i) {
                    failed = Some(e);
                }
            }
            Settled::Cancelled(e) => {
                cancelled.get_or_insert(e);
            }
        }
    }

    if let Some(mut error) = failed {
        if error.branches.is_empty() {
            error.branches = diagnostics;
        }
        return Gathered::Failed(error);
    }
    if let Some(error) = cancelled {
        return Gathered::Cancelled(error);
    }
    if let Some((point, _)) = point {
        return Gathered::Suspended { slots, point };
    }

    let mut outputs = Vec::with_capacity(slots.len());
    for slot in slots {
        if let BranchSlot::Completed { output, history } = slot {
            ctx.history.extend(history);
            outputs.push(output);
        }
    }
    Gathered::Done(outputs)
}

/// Take over the settlement of the race branch at `branch`.
fn adopt(
    branch: usize,
    outcome: ChainOutcome,
    history: Vec<HistoryEntry>,
    ctx: &mut ExecutionContext,
) -> StepOutcome {
    match outcome {
        ChainOutcome::Completed(output) => {
            ctx.history.extend(history);
            StepOutcome::Continue(output)
        }
        ChainOutcome::Suspended { cursor, mut point } => {
            point.path.insert(0, branch.to_string());
            StepOutcome::Suspend {
                inner: Some(StepCursor::Race {
                    branch,
                    cursor,
                    history,
                }),
                point,
            }
        }
        ChainOutcome::Failed(e) => StepOutcome::Fail(e),
        ChainOutcome::Cancelled(e) => StepOutcome::Cancel(e),
    }
}

/// Resume payload for a leaf step, which has no nested position.
fn leaf_resume(
    step: &Step,
    ctx: &ExecutionContext,
    resume: Option<StepResume>,
) -> Result<Option<Value>, StepOutcome> {
    match resume {
        None => Ok(None),
        Some(StepResume {
            inner: None,
            payload,
        }) => Ok(payload),
        Some(_) => Err(stale(step, ctx, "leaf steps have no nested position")),
    }
}

/// Call synchronous user code (predicates, mappers, checks), turning a
/// panic into a failed step.
fn call_sync<T>(step: &Step, ctx: &ExecutionContext, f: impl FnOnce() -> T) -> Result<T, StepOutcome> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|panic| fail(step, ctx, FailureKind::TaskPanicked, panic_message(panic.as_ref())))
}

fn fail(step: &Step, ctx: &ExecutionContext, kind: FailureKind, cause: impl Into<String>) -> StepOutcome {
    StepOutcome::Fail(StepExecutionError::new(step.id(), kind, cause, ctx.data.clone()))
}

fn sleeping(step: &Step, wake_at: DateTime<Utc>) -> StepOutcome {
    StepOutcome::Suspend {
        inner: Some(StepCursor::Sleep { wake_at }),
        point: SuspendPoint::leaf(step.id(), format!("sleeping until {}", wake_at.to_rfc3339()), None),
    }
}

fn stale(step: &Step, ctx: &ExecutionContext, detail: &str) -> StepOutcome {
    fail(
        step,
        ctx,
        FailureKind::StaleCursor,
        format!("resume position does not fit step '{}': {detail}", step.id()),
    )
}

fn cancelled(step: &Step) -> StepOutcome {
    StepOutcome::Cancel(CancellationError {
        step_id: Some(step.id().to_string()),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
