//! Infrastructure layer for stepchain.
//!
//! Contains implementations of the ports defined in `stepchain-core`: the
//! SQLite-backed suspension store and the `config.toml` loader.

pub mod config;
pub mod sqlite;
