//! Observability for stepchain: subscriber setup and a logger that turns the
//! workflow event stream into structured log lines.

pub mod event_log;
pub mod tracing_setup;

pub use event_log::{log_event, spawn_event_logger};
pub use tracing_setup::{init_tracing, shutdown_tracing};
