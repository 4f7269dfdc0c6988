//! Schema capability: validate a value against a declared shape.
//!
//! The engine only depends on the [`Schema`] trait. Two implementations ship
//! with the crate:
//! - [`Shape`]: a structural description built by hand or converted from a
//!   JSON Schema document.
//! - [`TypedSchema`]: derived from a Rust type via `schemars`, additionally
//!   checked by deserializing with serde.

pub mod shape;
pub mod typed;

use std::sync::Arc;

use serde_json::Value;
use stepchain_types::error::{ValidationError, ValidationTarget, Violation};

pub use shape::{Field, Shape};
pub use typed::TypedSchema;

/// Validates values; never coerces.
///
/// On success the returned value is the input value. On failure every
/// violation found is reported, each addressed by a JSON path.
pub trait Schema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<Value, Vec<Violation>>;

    /// Structural description used for build-time compatibility checks.
    /// Schemas that cannot describe themselves return `None` and are
    /// skipped by those checks.
    fn shape(&self) -> Option<Shape> {
        None
    }
}

/// Shared handle to a schema.
pub type SchemaRef = Arc<dyn Schema>;

pub fn schema_ref<S: Schema + 'static>(schema: S) -> SchemaRef {
    Arc::new(schema)
}

/// Run `schema` against `value`, tagging any failure with `target`.
pub fn check(
    schema: &dyn Schema,
    target: ValidationTarget,
    value: &Value,
) -> Result<Value, ValidationError> {
    schema
        .validate(value)
        .map_err(|violations| ValidationError::new(target, violations))
}

/// Like [`check`], but passes the value through when no schema is declared.
pub fn check_optional(
    schema: Option<&SchemaRef>,
    target: ValidationTarget,
    value: &Value,
) -> Result<(), ValidationError> {
    match schema {
        Some(schema) => check(schema.as_ref(), target, value).map(|_| ()),
        None => Ok(()),
    }
}
