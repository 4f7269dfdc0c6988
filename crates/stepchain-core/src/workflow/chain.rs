//! Chain definitions and the fluent builder.
//!
//! `chain(config)` starts a builder; each `and_*` call appends exactly one
//! step and returns the builder by value. `build()` yields an immutable,
//! cheaply cloneable [`Chain`].
//!
//! Shape compatibility is checked eagerly: when a step declares an input
//! schema and the previous step's output shape is known, the output must be
//! assignable to the input. The first such error is kept and reported by
//! `build()`.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;

use super::context::StepContext;
use super::error::{BuildError, StepError};
use super::step::{
    AgentDef, BranchCaseDef, GuardrailVerdict, LoopMode, SleepSpec, Step, StepDef, StepKind,
    review_schema,
};
use crate::schema::{Schema, SchemaRef, Shape, schema_ref};

// ---------------------------------------------------------------------------
// ChainConfig
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChainConfig {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) input_schema: Option<SchemaRef>,
    pub(crate) result_schema: Option<SchemaRef>,
}

impl ChainConfig {
    /// A config whose name defaults to its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            input_schema: None,
            result_schema: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.input_schema = Some(schema_ref(schema));
        self
    }

    pub fn result_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.result_schema = Some(schema_ref(schema));
        self
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

struct ChainInner {
    config: ChainConfig,
    steps: Vec<Step>,
    output_shape: Option<Shape>,
}

/// An immutable, ordered list of steps.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

impl Chain {
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.inner.steps
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.inner.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.inner.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.steps.is_empty()
    }

    pub fn input_schema(&self) -> Option<&SchemaRef> {
        self.inner.config.input_schema.as_ref()
    }

    pub fn result_schema(&self) -> Option<&SchemaRef> {
        self.inner.config.result_schema.as_ref()
    }

    /// Shape of the data this chain produces, when every step declares enough
    /// to know it.
    pub fn output_shape(&self) -> Option<&Shape> {
        self.inner.output_shape.as_ref()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id())
            .field("steps", &self.inner.steps)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub fn chain(config: ChainConfig) -> ChainBuilder {
    let last_output = config.input_schema.as_ref().and_then(|s| s.shape());
    ChainBuilder {
        config,
        steps: Vec::new(),
        last_output,
        error: None,
    }
}

#[derive(Clone)]
pub struct ChainBuilder {
    config: ChainConfig,
    steps: Vec<Step>,
    last_output: Option<Shape>,
    error: Option<BuildError>,
}

impl ChainBuilder {
    pub fn and_then(self, def: StepDef) -> Self {
        self.push(def.into_step())
    }

    pub fn and_agent(self, def: AgentDef) -> Self {
        self.push(def.into_step())
    }

    /// Splice `then` in when `predicate` holds; otherwise pass data through.
    pub fn and_when<P>(self, predicate: P, then: Chain) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push_auto(StepKind::When {
            predicate: Arc::new(predicate),
            chain: then,
        })
    }

    /// Run the chain of the first matching case, or `default`.
    pub fn and_branch(
        self,
        cases: impl IntoIterator<Item = BranchCaseDef>,
        default: Option<Chain>,
    ) -> Self {
        self.push_auto(StepKind::Branch {
            cases: cases.into_iter().map(|c| c.0).collect(),
            default,
        })
    }

    /// Run every branch concurrently on a copy of the data; yields an array
    /// of branch results in branch order.
    pub fn and_all(self, branches: impl IntoIterator<Item = Chain>) -> Self {
        self.push_auto(StepKind::All(branches.into_iter().collect()))
    }

    /// Run every branch concurrently; the first to settle decides.
    pub fn and_race(self, branches: impl IntoIterator<Item = Chain>) -> Self {
        self.push_auto(StepKind::Race(branches.into_iter().collect()))
    }

    pub fn and_for_each(self, item: Chain) -> Self {
        self.push_auto(StepKind::ForEach {
            chain: item,
            concurrency: None,
        })
    }

    /// Like [`Self::and_for_each`], processing `concurrency` items at a time.
    pub fn and_for_each_with(self, item: Chain, concurrency: usize) -> Self {
        self.push_auto(StepKind::ForEach {
            chain: item,
            concurrency: Some(concurrency),
        })
    }

    /// Run `body` while `condition` holds, checked before each iteration.
    pub fn and_loop<P>(self, condition: P, body: Chain) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push_loop(LoopMode::While, Arc::new(condition), body)
    }

    pub fn and_do_while<P>(self, condition: P, body: Chain) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push_loop(LoopMode::DoWhile, Arc::new(condition), body)
    }

    pub fn and_do_until<P>(self, condition: P, body: Chain) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push_loop(LoopMode::DoUntil, Arc::new(condition), body)
    }

    /// Run a side effect; the data passes through unchanged.
    pub fn and_tap<F, Fut>(self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.push_auto(StepKind::Tap(Arc::new(move |ctx| f(ctx).boxed())))
    }

    pub fn and_guardrail<F>(self, check: F) -> Self
    where
        F: Fn(&Value) -> GuardrailVerdict + Send + Sync + 'static,
    {
        let mut builder = self.push_auto(StepKind::Guardrail(Arc::new(check)));
        if let Some(step) = builder.steps.last_mut() {
            step.resume_schema = Some(review_schema());
        }
        builder
    }

    pub fn and_sleep(self, spec: impl Into<SleepSpec>) -> Self {
        self.push_auto(StepKind::Sleep(spec.into()))
    }

    pub fn and_map<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.push_auto(StepKind::Map(Arc::new(f)))
    }

    /// Rename the most recently appended step.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.error.is_some() {
            return self;
        }
        let Some(last) = self.steps.len().checked_sub(1) else {
            self.error = Some(BuildError::NoStepToRename(id));
            return self;
        };
        if self.steps[..last].iter().any(|s| s.id == id) {
            self.error = Some(BuildError::DuplicateStepId(id));
            return self;
        }
        self.steps[last].id = id;
        self
    }

    pub fn build(self) -> Result<Chain, BuildError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let result_shape = self.config.result_schema.as_ref().and_then(|s| s.shape());
        if let (Some(expected), Some(actual)) = (&result_shape, &self.last_output) {
            if !actual.is_assignable_to(expected) {
                return Err(BuildError::IncompatibleResult {
                    chain_id: self.config.id.clone(),
                    expected: expected.describe(),
                    actual: actual.describe(),
                });
            }
        }
        Ok(Chain {
            inner: Arc::new(ChainInner {
                config: self.config,
                steps: self.steps,
                output_shape: self.last_output,
            }),
        })
    }

    fn push_auto(self, kind: StepKind) -> Self {
        let id = format!("{}-{}", kind.name(), self.steps.len());
        self.push(Step::new(id, kind))
    }

    fn push_loop(self, mode: LoopMode, condition: super::step::Predicate, body: Chain) -> Self {
        self.push_auto(StepKind::Loop {
            mode,
            condition,
            body,
        })
    }

    fn push(mut self, step: Step) -> Self {
        if self.error.is_none() {
            self.error = self.check(&step).err();
        }
        self.last_output = output_after(&step, self.last_output.take());
        self.steps.push(step);
        self
    }

    fn check(&self, step: &Step) -> Result<(), BuildError> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(BuildError::DuplicateStepId(step.id.clone()));
        }
        match &step.kind {
            StepKind::Race(branches) if branches.is_empty() => {
                return Err(BuildError::EmptyRace(step.id.clone()));
            }
            StepKind::ForEach {
                concurrency: Some(0),
                ..
            } => return Err(BuildError::InvalidConcurrency(step.id.clone())),
            _ => {}
        }
        let expected = step.input_schema.as_ref().and_then(|s| s.shape());
        if let (Some(expected), Some(actual)) = (&expected, &self.last_output) {
            if !actual.is_assignable_to(expected) {
                return Err(BuildError::IncompatibleShapes {
                    step_id: step.id.clone(),
                    expected: expected.describe(),
                    actual: actual.describe(),
                });
            }
        }
        Ok(())
    }
}

/// Output shape after `step` runs, given the shape flowing into it.
fn output_after(step: &Step, incoming: Option<Shape>) -> Option<Shape> {
    if step.kind.is_passthrough() {
        return incoming;
    }
    if let Some(declared) = step.output_schema.as_ref().and_then(|s| s.shape()) {
        return Some(declared);
    }
    match &step.kind {
        StepKind::ForEach { chain, .. } => chain.output_shape().cloned().map(Shape::array),
        StepKind::All(branches) => branch_union(branches).map(Shape::array),
        StepKind::Race(branches) => branch_union(branches),
        _ => None,
    }
}

fn branch_union(branches: &[Chain]) -> Option<Shape> {
    let shapes: Option<Vec<Shape>> = branches.iter().map(|b| b.output_shape().cloned()).collect();
    let mut shapes = shapes?;
    shapes.dedup();
    match shapes.len() {
        0 => None,
        1 => shapes.pop(),
        _ => Some(Shape::union(shapes)),
    }
}
