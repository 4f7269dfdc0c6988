//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `config.toml` that tunes the execution engine:
//! step timeouts, event channel sizing, for-each parallelism and storage.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the execution engine and its runtime.
///
/// Every field has a default, so an empty `config.toml` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a single leaf step's execution, in seconds.
    /// `None` disables the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Window size used by `and_for_each` when the step does not set one.
    #[serde(default = "default_for_each_concurrency")]
    pub default_for_each_concurrency: usize,

    /// SQLite URL for the suspension store. `None` means the default data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_for_each_concurrency() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: None,
            event_capacity: default_event_capacity(),
            default_for_each_concurrency: default_for_each_concurrency(),
            database_url: None,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
