//! Shared domain types for stepchain.
//!
//! This crate contains the serializable types that cross the boundary between
//! the engine and its collaborators: suspension records and cursors, start
//! results, execution status, workflow events, configuration and the error
//! payloads carried inside results.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, toml.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
