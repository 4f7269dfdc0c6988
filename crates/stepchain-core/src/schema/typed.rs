//! Schemas derived from Rust types.
//!
//! `TypedSchema<T>` converts the JSON Schema that `schemars` generates for `T`
//! into a [`Shape`] for structural checks and path-addressed violations, then
//! confirms the value deserializes into `T`.

use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stepchain_types::error::Violation;

use super::{Schema, Shape};

pub struct TypedSchema<T> {
    shape: Shape,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JsonSchema + DeserializeOwned> TypedSchema<T> {
    pub fn new() -> Self {
        let schema = schemars::schema_for!(T);
        Self {
            shape: Shape::from_json_schema(schema.as_value()),
            _marker: PhantomData,
        }
    }
}

impl<T: JsonSchema + DeserializeOwned> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSchema")
            .field("type", &std::any::type_name::<T>())
            .field("shape", &self.shape)
            .finish()
    }
}

impl<T: DeserializeOwned> Schema for TypedSchema<T> {
    fn validate(&self, value: &Value) -> Result<Value, Vec<Violation>> {
        let violations = self.shape.violations(value);
        if !violations.is_empty() {
            return Err(violations);
        }
        // Catches constraints the shape does not model (e.g. integer ranges).
        serde_json::from_value::<T>(value.clone())
            .map_err(|e| vec![Violation::new("$", e.to_string())])?;
        Ok(value.clone())
    }

    fn shape(&self) -> Option<Shape> {
        Some(self.shape.clone())
    }
}
