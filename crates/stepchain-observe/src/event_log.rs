//! Structured logging of the workflow event stream.
//!
//! `spawn_event_logger` subscribes to a runtime's event bus and writes each
//! event as a tracing record with `execution_id` and `step_id` fields.

use stepchain_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Emit one log record for `event`.
///
/// Lifecycle transitions log at `info`, failures at `warn`, and per-step
/// traffic at `debug`.
pub fn log_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::ExecutionStarted { execution_id, chain_id } => {
            tracing::info!(execution_id = %execution_id, chain_id = %chain_id, "execution started");
        }
        WorkflowEvent::ExecutionResumed { execution_id, chain_id, step_id } => {
            tracing::info!(
                execution_id = %execution_id,
                chain_id = %chain_id,
                step_id = %step_id,
                "execution resumed"
            );
        }
        WorkflowEvent::ExecutionSuspended { execution_id, step_id, reason, wake_at } => {
            tracing::info!(
                execution_id = %execution_id,
                step_id = %step_id,
                reason = %reason,
                wake_at = ?wake_at,
                "execution suspended"
            );
        }
        WorkflowEvent::ExecutionCompleted { execution_id, duration_ms } => {
            tracing::info!(execution_id = %execution_id, duration_ms, "execution completed");
        }
        WorkflowEvent::ExecutionFailed { execution_id, step_id, error } => {
            tracing::warn!(
                execution_id = %execution_id,
                step_id = %step_id,
                error = %error,
                "execution failed"
            );
        }
        WorkflowEvent::ExecutionCancelled { execution_id, step_id } => {
            tracing::info!(execution_id = %execution_id, step_id = ?step_id, "execution cancelled");
        }
        WorkflowEvent::StepStarted { execution_id, step_id, kind } => {
            tracing::debug!(execution_id = %execution_id, step_id = %step_id, kind = %kind, "step started");
        }
        WorkflowEvent::StepCompleted { execution_id, step_id, duration_ms, .. } => {
            tracing::debug!(execution_id = %execution_id, step_id = %step_id, duration_ms, "step completed");
        }
        WorkflowEvent::StepFailed { execution_id, step_id, error } => {
            tracing::warn!(execution_id = %execution_id, step_id = %step_id, error = %error, "step failed");
        }
        WorkflowEvent::StepProgress { execution_id, step_id, .. } => {
            tracing::trace!(execution_id = %execution_id, step_id = %step_id, "step progress");
        }
    }
}

/// Log every event from `rx` until the bus closes.
///
/// Returns the number of events logged. A lagging receiver logs how many
/// events it skipped and keeps going.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<WorkflowEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        logged
    })
}
