//! Suspension store port and its in-process implementation.
//!
//! `SuspensionStore` is the storage interface that adapters (see
//! `stepchain-infra`) implement. The core crate never depends on a specific
//! storage technology.

pub mod memory;
pub mod suspension;

pub use memory::InMemorySuspensionStore;
pub use suspension::SuspensionStore;
