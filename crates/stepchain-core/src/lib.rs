//! Chain composition, execution engine and suspension ports for stepchain.
//!
//! This crate defines the "ports" (the `SuspensionStore` trait, the `Delegate`
//! trait, the `Schema` capability) that adapters implement. It depends only on
//! `stepchain-types` -- never on `stepchain-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod schema;
pub mod workflow;
