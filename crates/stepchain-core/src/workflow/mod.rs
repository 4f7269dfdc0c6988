//! Workflow composition and execution.
//!
//! - `chain` / `step`: the fluent builder and step definitions
//! - `engine`: the interpreter that runs chains and produces cursors
//! - `runtime`: start, resume, status, cancel and timed wake-ups
//! - `context`: execution context, shared workflow state, step view
//! - `delegate`: the port used by `and_agent` steps

pub mod chain;
pub mod context;
mod cursor;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod step;

pub use chain::{Chain, ChainBuilder, ChainConfig, chain};
pub use context::{ExecutionContext, StepContext, WorkflowState};
pub use delegate::{BoxDelegate, Delegate, DelegateError, DelegateRequest};
pub use engine::Engine;
pub use error::{BuildError, ResumeError, StartError, StepError};
pub use runtime::{WakeResult, WorkflowRuntime};
pub use step::{
    AgentDef, BranchCaseDef, GuardrailVerdict, LoopMode, ReviewDecision, SleepSpec, Step, StepDef,
    case, step,
};
