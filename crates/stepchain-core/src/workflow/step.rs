//! Step definitions.
//!
//! A `Step` is one entry of a chain: a stable id, a kind-specific payload and
//! optional input/output/resume schemas. Leaf logic is stored as boxed
//! closures so that chains stay `Send + Sync` and cheap to clone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chain::Chain;
use super::context::StepContext;
use super::delegate::BoxDelegate;
use super::error::StepError;
use crate::schema::{Schema, SchemaRef, TypedSchema, schema_ref};

pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
pub type TapFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type MapFn = Arc<dyn Fn(Value) -> Result<Value, StepError> + Send + Sync>;
pub type PromptFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub type AgentMapper = Arc<dyn Fn(Value, &StepContext) -> Result<Value, StepError> + Send + Sync>;
pub type GuardrailFn = Arc<dyn Fn(&Value) -> GuardrailVerdict + Send + Sync>;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Result of a guardrail check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailVerdict {
    Pass,
    /// Fail the execution.
    Block(String),
    /// Suspend until a reviewer approves or rejects.
    Review(String),
}

/// Resume payload accepted by a guardrail held for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Check the condition before each iteration.
    While,
    /// Run once, then repeat while the condition holds.
    DoWhile,
    /// Run once, then repeat until the condition holds.
    DoUntil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepSpec {
    For(Duration),
    Until(DateTime<Utc>),
}

impl From<Duration> for SleepSpec {
    fn from(d: Duration) -> Self {
        SleepSpec::For(d)
    }
}

impl From<DateTime<Utc>> for SleepSpec {
    fn from(at: DateTime<Utc>) -> Self {
        SleepSpec::Until(at)
    }
}

#[derive(Clone)]
pub(crate) struct AgentSpec {
    pub delegate: BoxDelegate,
    pub prompt: PromptFn,
    pub output_schema: SchemaRef,
    pub mapper: Option<AgentMapper>,
}

#[derive(Clone)]
pub(crate) struct BranchCase {
    pub predicate: Predicate,
    pub chain: Chain,
}

#[derive(Clone)]
pub(crate) enum StepKind {
    Then(StepFn),
    Agent(AgentSpec),
    When {
        predicate: Predicate,
        chain: Chain,
    },
    Branch {
        cases: Vec<BranchCase>,
        default: Option<Chain>,
    },
    All(Vec<Chain>),
    Race(Vec<Chain>),
    ForEach {
        chain: Chain,
        concurrency: Option<usize>,
    },
    Loop {
        mode: LoopMode,
        condition: Predicate,
        body: Chain,
    },
    Tap(TapFn),
    Guardrail(GuardrailFn),
    Sleep(SleepSpec),
    Map(MapFn),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Then(_) => "then",
            StepKind::Agent(_) => "agent",
            StepKind::When { .. } => "when",
            StepKind::Branch { .. } => "branch",
            StepKind::All(_) => "all",
            StepKind::Race(_) => "race",
            StepKind::ForEach { .. } => "for-each",
            StepKind::Loop { .. } => "loop",
            StepKind::Tap(_) => "tap",
            StepKind::Guardrail(_) => "guardrail",
            StepKind::Sleep(_) => "sleep",
            StepKind::Map(_) => "map",
        }
    }

    /// Kinds that hand their input through unchanged.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            StepKind::Tap(_) | StepKind::Guardrail(_) | StepKind::Sleep(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Step {
    pub(crate) id: String,
    pub(crate) kind: StepKind,
    pub(crate) input_schema: Option<SchemaRef>,
    pub(crate) output_schema: Option<SchemaRef>,
    pub(crate) resume_schema: Option<SchemaRef>,
}

impl Step {
    pub(crate) fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            input_schema: None,
            output_schema: None,
            resume_schema: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn input_schema(&self) -> Option<&SchemaRef> {
        self.input_schema.as_ref()
    }

    pub fn output_schema(&self) -> Option<&SchemaRef> {
        self.output_schema.as_ref()
    }

    /// Schema a resume payload must satisfy. Present only on steps that
    /// may suspend for external input.
    pub fn resume_schema(&self) -> Option<&SchemaRef> {
        self.resume_schema.as_ref()
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("resumable", &self.resume_schema.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Definitions accepted by the builder
// ---------------------------------------------------------------------------

/// A transform step for `and_then`.
pub struct StepDef {
    pub(crate) id: String,
    pub(crate) run: StepFn,
    pub(crate) input_schema: Option<SchemaRef>,
    pub(crate) output_schema: Option<SchemaRef>,
    pub(crate) resume_schema: Option<SchemaRef>,
}

impl StepDef {
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Arc::new(move |ctx| run(ctx).boxed()),
            input_schema: None,
            output_schema: None,
            resume_schema: None,
        }
    }

    pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.input_schema = Some(schema_ref(schema));
        self
    }

    pub fn output_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.output_schema = Some(schema_ref(schema));
        self
    }

    pub fn resume_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.resume_schema = Some(schema_ref(schema));
        self
    }

    pub(crate) fn into_step(self) -> Step {
        Step {
            id: self.id,
            kind: StepKind::Then(self.run),
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            resume_schema: self.resume_schema,
        }
    }
}

/// Shorthand for [`StepDef::new`].
pub fn step<F, Fut>(id: impl Into<String>, run: F) -> StepDef
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    StepDef::new(id, run)
}

/// A delegate step for `and_agent`.
pub struct AgentDef {
    pub(crate) id: String,
    pub(crate) spec: AgentSpec,
    pub(crate) input_schema: Option<SchemaRef>,
}

impl AgentDef {
    pub fn new<P>(
        id: impl Into<String>,
        delegate: BoxDelegate,
        prompt: P,
        output_schema: impl Schema + 'static,
    ) -> Self
    where
        P: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            spec: AgentSpec {
                delegate,
                prompt: Arc::new(prompt),
                output_schema: schema_ref(output_schema),
                mapper: None,
            },
            input_schema: None,
        }
    }

    /// Combine the validated delegate output with the context instead of
    /// replacing the data outright.
    pub fn map_output<M>(mut self, mapper: M) -> Self
    where
        M: Fn(Value, &StepContext) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.spec.mapper = Some(Arc::new(mapper));
        self
    }

    pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.input_schema = Some(schema_ref(schema));
        self
    }

    pub(crate) fn into_step(self) -> Step {
        // Without a mapper the delegate output becomes the data, so its
        // schema doubles as the step's output schema.
        let output_schema = match self.spec.mapper {
            None => Some(Arc::clone(&self.spec.output_schema)),
            Some(_) => None,
        };
        Step {
            id: self.id,
            kind: StepKind::Agent(self.spec),
            input_schema: self.input_schema,
            output_schema,
            resume_schema: None,
        }
    }
}

/// One `and_branch` case: the chain to run when `predicate` holds.
pub fn case<P>(predicate: P, chain: Chain) -> BranchCaseDef
where
    P: Fn(&Value) -> bool + Send + Sync + 'static,
{
    BranchCaseDef(BranchCase {
        predicate: Arc::new(predicate),
        chain,
    })
}

pub struct BranchCaseDef(pub(crate) BranchCase);

pub(crate) fn review_schema() -> SchemaRef {
    schema_ref(TypedSchema::<ReviewDecision>::new())
}
