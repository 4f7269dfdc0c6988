//! Structural shapes for JSON values.
//!
//! A `Shape` describes what a value must look like. It validates values
//! (reporting every violation with a JSON path such as `$.items[2].id`),
//! answers build-time compatibility questions via [`Shape::is_assignable_to`],
//! and can be derived from a JSON Schema document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepchain_types::error::Violation;

use super::Schema;

/// Guard against self-referential `$ref` chains.
const MAX_REF_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Any,
    Null,
    Bool,
    Number,
    Integer,
    String,
    Array {
        items: Box<Shape>,
    },
    Object {
        fields: Vec<Field>,
        /// Whether keys not listed in `fields` are accepted.
        #[serde(default = "default_true")]
        additional: bool,
    },
    /// The inner shape or `null`.
    Optional {
        inner: Box<Shape>,
    },
    /// Any of the listed shapes.
    Union {
        variants: Vec<Shape>,
    },
    /// One of a fixed set of literal values.
    Enum {
        values: Vec<Value>,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
}

impl Field {
    pub fn required(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: false,
        }
    }
}

impl Shape {
    /// An open object (unknown keys accepted).
    pub fn object(fields: impl IntoIterator<Item = Field>) -> Self {
        Shape::Object {
            fields: fields.into_iter().collect(),
            additional: true,
        }
    }

    /// An object that rejects keys not listed in `fields`.
    pub fn closed_object(fields: impl IntoIterator<Item = Field>) -> Self {
        Shape::Object {
            fields: fields.into_iter().collect(),
            additional: false,
        }
    }

    pub fn array(items: Shape) -> Self {
        Shape::Array {
            items: Box::new(items),
        }
    }

    pub fn optional(inner: Shape) -> Self {
        Shape::Optional {
            inner: Box::new(inner),
        }
    }

    pub fn union(variants: impl IntoIterator<Item = Shape>) -> Self {
        Shape::Union {
            variants: variants.into_iter().collect(),
        }
    }

    pub fn literals(values: impl IntoIterator<Item = Value>) -> Self {
        Shape::Enum {
            values: values.into_iter().collect(),
        }
    }

    /// Short name used in violation messages.
    pub fn describe(&self) -> String {
        match self {
            Shape::Any => "any".to_string(),
            Shape::Null => "null".to_string(),
            Shape::Bool => "bool".to_string(),
            Shape::Number => "number".to_string(),
            Shape::Integer => "integer".to_string(),
            Shape::String => "string".to_string(),
            Shape::Array { items } => format!("array<{}>", items.describe()),
            Shape::Object { .. } => "object".to_string(),
            Shape::Optional { inner } => format!("{}?", inner.describe()),
            Shape::Union { variants } => variants
                .iter()
                .map(Shape::describe)
                .collect::<Vec<_>>()
                .join(" | "),
            Shape::Enum { values } => format!(
                "one of [{}]",
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    /// Collect every violation of `value` against this shape.
    pub fn violations(&self, value: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        self.collect("$", value, &mut out);
        out
    }

    fn collect(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        match (self, value) {
            (Shape::Any, _) => {}
            (Shape::Null, Value::Null) => {}
            (Shape::Bool, Value::Bool(_)) => {}
            (Shape::Number, Value::Number(_)) => {}
            (Shape::Integer, Value::Number(n)) if is_integral(n) => {}
            (Shape::String, Value::String(_)) => {}
            (Shape::Optional { .. }, Value::Null) => {}
            (Shape::Optional { inner }, _) => inner.collect(path, value, out),
            (Shape::Array { items }, Value::Array(elements)) => {
                for (i, element) in elements.iter().enumerate() {
                    items.collect(&format!("{path}[{i}]"), element, out);
                }
            }
            (Shape::Object { fields, additional }, Value::Object(map)) => {
                for field in fields {
                    let field_path = format!("{path}.{}", field.name);
                    match map.get(&field.name) {
                        Some(v) => field.shape.collect(&field_path, v, out),
                        None if field.required => {
                            out.push(Violation::new(field_path, "required field is missing"));
                        }
                        None => {}
                    }
                }
                if !additional {
                    for key in map.keys() {
                        if !fields.iter().any(|f| &f.name == key) {
                            out.push(Violation::new(format!("{path}.{key}"), "unexpected field"));
                        }
                    }
                }
            }
            (Shape::Union { variants }, _) => {
                if !variants.iter().any(|v| v.violations_at(path, value).is_empty()) {
                    out.push(Violation::new(
                        path,
                        format!("expected {}, got {}", self.describe(), kind_of(value)),
                    ));
                }
            }
            (Shape::Enum { values }, _) => {
                if !values.contains(value) {
                    out.push(Violation::new(
                        path,
                        format!("expected {}, got {value}", self.describe()),
                    ));
                }
            }
            _ => out.push(Violation::new(
                path,
                format!("expected {}, got {}", self.describe(), kind_of(value)),
            )),
        }
    }

    fn violations_at(&self, path: &str, value: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        self.collect(path, value, &mut out);
        out
    }

    /// Whether every value accepted by `self` is accepted by `target`.
    ///
    /// `Any` on either side is treated as compatible, since nothing is known
    /// statically about it.
    pub fn is_assignable_to(&self, target: &Shape) -> bool {
        match (self, target) {
            (Shape::Any, _) | (_, Shape::Any) => true,
            (Shape::Union { variants }, _) => variants.iter().all(|v| v.is_assignable_to(target)),
            (Shape::Enum { values }, _) => values.iter().all(|v| target.violations(v).is_empty()),
            (Shape::Optional { inner }, _) => {
                Shape::Null.is_assignable_to(target) && inner.is_assignable_to(target)
            }
            (Shape::Null, Shape::Optional { .. }) => true,
            (_, Shape::Optional { inner }) => self.is_assignable_to(inner),
            (_, Shape::Union { variants }) => variants.iter().any(|v| self.is_assignable_to(v)),
            (Shape::Null, Shape::Null)
            | (Shape::Bool, Shape::Bool)
            | (Shape::Number, Shape::Number)
            | (Shape::Integer, Shape::Number)
            | (Shape::Integer, Shape::Integer)
            | (Shape::String, Shape::String) => true,
            (Shape::Array { items: a }, Shape::Array { items: b }) => a.is_assignable_to(b),
            (
                Shape::Object {
                    fields: source_fields,
                    additional: source_additional,
                },
                Shape::Object {
                    fields: target_fields,
                    additional: target_additional,
                },
            ) => {
                let targets_ok = target_fields.iter().all(|tf| {
                    match source_fields.iter().find(|sf| sf.name == tf.name) {
                        Some(sf) => (sf.required || !tf.required) && sf.shape.is_assignable_to(&tf.shape),
                        None => !tf.required,
                    }
                });
                let extras_ok = *target_additional
                    || (!source_additional
                        && source_fields
                            .iter()
                            .all(|sf| target_fields.iter().any(|tf| tf.name == sf.name)));
                targets_ok && extras_ok
            }
            _ => false,
        }
    }

    /// Convert a JSON Schema document (draft 7 or 2020-12) into a shape.
    ///
    /// Handles `$ref` into `$defs`/`definitions`, `type` arrays containing
    /// `null`, `anyOf`/`oneOf`, `enum`/`const` and `additionalProperties`.
    /// Keywords without a structural counterpart are ignored.
    pub fn from_json_schema(schema: &Value) -> Shape {
        convert(schema, schema, 0)
    }
}

impl Schema for Shape {
    fn validate(&self, value: &Value) -> Result<Value, Vec<Violation>> {
        let violations = self.violations(value);
        if violations.is_empty() {
            Ok(value.clone())
        } else {
            Err(violations)
        }
    }

    fn shape(&self) -> Option<Shape> {
        Some(self.clone())
    }
}

fn is_integral(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn convert(node: &Value, root: &Value, depth: usize) -> Shape {
    if depth > MAX_REF_DEPTH {
        return Shape::Any;
    }
    let obj = match node {
        Value::Bool(true) => return Shape::Any,
        Value::Bool(false) => return Shape::Union { variants: Vec::new() },
        Value::Object(obj) => obj,
        _ => return Shape::Any,
    };

    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        return match reference.strip_prefix('#').and_then(|p| root.pointer(p)) {
            Some(target) => convert(target, root, depth + 1),
            None => Shape::Any,
        };
    }
    if let Some(values) = obj.get("enum").and_then(Value::as_array) {
        return Shape::Enum {
            values: values.clone(),
        };
    }
    if let Some(value) = obj.get("const") {
        return Shape::Enum {
            values: vec![value.clone()],
        };
    }
    for key in ["anyOf", "oneOf"] {
        if let Some(options) = obj.get(key).and_then(Value::as_array) {
            let variants: Vec<Shape> = options.iter().map(|o| convert(o, root, depth + 1)).collect();
            return simplify_union(variants);
        }
    }
    if let Some(all) = obj.get("allOf").and_then(Value::as_array) {
        if all.len() == 1 {
            return convert(&all[0], root, depth + 1);
        }
        return Shape::Any;
    }

    match obj.get("type") {
        Some(Value::String(name)) => from_type_name(name, obj, root, depth),
        Some(Value::Array(names)) => {
            let variants: Vec<Shape> = names
                .iter()
                .filter_map(Value::as_str)
                .map(|name| from_type_name(name, obj, root, depth))
                .collect();
            simplify_union(variants)
        }
        _ if obj.contains_key("properties") => from_type_name("object", obj, root, depth),
        _ => Shape::Any,
    }
}

fn from_type_name(
    name: &str,
    obj: &serde_json::Map<String, Value>,
    root: &Value,
    depth: usize,
) -> Shape {
    match name {
        "null" => Shape::Null,
        "boolean" => Shape::Bool,
        "integer" => Shape::Integer,
        "number" => Shape::Number,
        "string" => Shape::String,
        "array" => Shape::Array {
            items: Box::new(
                obj.get("items")
                    .map(|items| convert(items, root, depth + 1))
                    .unwrap_or(Shape::Any),
            ),
        },
        "object" => {
            let required: Vec<&str> = obj
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let fields = obj
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| {
                    props
                        .iter()
                        .map(|(key, prop)| Field {
                            name: key.clone(),
                            shape: convert(prop, root, depth + 1),
                            required: required.contains(&key.as_str()),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let additional = !matches!(obj.get("additionalProperties"), Some(Value::Bool(false)));
            Shape::Object { fields, additional }
        }
        _ => Shape::Any,
    }
}

/// Collapse `[T, null]` into `Optional(T)` and single-element unions into
/// their element.
fn simplify_union(mut variants: Vec<Shape>) -> Shape {
    let had_null = variants.iter().any(|v| *v == Shape::Null);
    variants.retain(|v| *v != Shape::Null);
    let inner = match variants.len() {
        0 if had_null => return Shape::Null,
        1 => variants.remove(0),
        _ => Shape::Union { variants },
    };
    if had_null {
        Shape::optional(inner)
    } else {
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval() -> Shape {
        Shape::object([
            Field::required("approved", Shape::Bool),
            Field::required("managerId", Shape::String),
            Field::optional("note", Shape::String),
        ])
    }

    #[test]
    fn valid_object_passes_unchanged() {
        let value = json!({ "approved": true, "managerId": "m-1" });
        assert_eq!(approval().validate(&value).unwrap(), value);
    }

    #[test]
    fn reports_every_violation_with_paths() {
        let value = json!({ "approved": "yes", "note": 3 });
        let violations = approval().violations(&value);
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["$.approved", "$.managerId", "$.note"]);
        assert_eq!(violations[0].message, "expected bool, got string");
        assert_eq!(violations[1].message, "required field is missing");
    }

    #[test]
    fn array_paths_include_index() {
        let shape = Shape::array(Shape::object([Field::required("id", Shape::Integer)]));
        let violations = shape.violations(&json!([{ "id": 1 }, { "id": "x" }]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "$[1].id");
    }

    #[test]
    fn closed_object_rejects_extra_keys() {
        let shape = Shape::closed_object([Field::required("a", Shape::Integer)]);
        let violations = shape.violations(&json!({ "a": 1, "b": 2 }));
        assert_eq!(violations, vec![Violation::new("$.b", "unexpected field")]);
    }

    #[test]
    fn integer_accepts_whole_floats_only() {
        assert!(Shape::Integer.violations(&json!(2.0)).is_empty());
        assert!(!Shape::Integer.violations(&json!(2.5)).is_empty());
        assert!(Shape::Number.violations(&json!(2.5)).is_empty());
    }

    #[test]
    fn optional_and_union() {
        let shape = Shape::optional(Shape::union([Shape::String, Shape::Integer]));
        assert!(shape.violations(&json!(null)).is_empty());
        assert!(shape.violations(&json!("a")).is_empty());
        assert!(shape.violations(&json!(4)).is_empty());
        assert_eq!(shape.violations(&json!(true)).len(), 1);
    }

    #[test]
    fn assignability_rules() {
        assert!(Shape::Integer.is_assignable_to(&Shape::Number));
        assert!(!Shape::Number.is_assignable_to(&Shape::Integer));
        assert!(Shape::String.is_assignable_to(&Shape::optional(Shape::String)));
        assert!(!Shape::optional(Shape::String).is_assignable_to(&Shape::String));
        assert!(Shape::Any.is_assignable_to(&Shape::String));
        assert!(Shape::literals([json!("a"), json!("b")]).is_assignable_to(&Shape::String));

        let wide = Shape::object([
            Field::required("id", Shape::Integer),
            Field::required("name", Shape::String),
        ]);
        let narrow = Shape::object([Field::required("id", Shape::Number)]);
        assert!(wide.is_assignable_to(&narrow));
        assert!(!narrow.is_assignable_to(&wide));

        let closed = Shape::closed_object([Field::required("id", Shape::Number)]);
        assert!(!wide.is_assignable_to(&closed));
    }

    #[test]
    fn converts_json_schema_with_refs_and_nullables() {
        let schema = json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "format": "uint32", "minimum": 0 },
                "label": { "type": ["string", "null"] },
                "owner": { "$ref": "#/$defs/Owner" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "level": { "type": "string", "enum": ["low", "high"] }
            },
            "required": ["id", "owner", "tags", "level"],
            "additionalProperties": false,
            "$defs": {
                "Owner": {
                    "type": "object",
                    "properties": { "email": { "type": "string" } },
                    "required": ["email"]
                }
            }
        });
        let shape = Shape::from_json_schema(&schema);
        let Shape::Object { fields, additional } = &shape else {
            panic!("expected object, got {shape:?}");
        };
        assert!(!additional);
        let field = |name: &str| fields.iter().find(|f| f.name == name).unwrap();
        assert_eq!(field("id").shape, Shape::Integer);
        assert_eq!(field("label").shape, Shape::optional(Shape::String));
        assert!(!field("label").required);
        assert_eq!(field("tags").shape, Shape::array(Shape::String));
        assert!(matches!(field("owner").shape, Shape::Object { .. }));
        assert!(matches!(field("level").shape, Shape::Enum { .. }));

        let ok = json!({ "id": 1, "owner": { "email": "a@b" }, "tags": [], "level": "low" });
        assert!(shape.violations(&ok).is_empty());
        let bad = json!({ "id": 1, "owner": {}, "tags": [], "level": "mid" });
        let mut paths: Vec<String> = shape.violations(&bad).into_iter().map(|v| v.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["$.level", "$.owner.email"]);
    }

    #[test]
    fn any_of_with_null_becomes_optional() {
        let schema = json!({ "anyOf": [{ "type": "integer" }, { "type": "null" }] });
        assert_eq!(Shape::from_json_schema(&schema), Shape::optional(Shape::Integer));
        assert_eq!(Shape::from_json_schema(&json!(true)), Shape::Any);
    }

    #[test]
    fn self_referential_schema_terminates() {
        let schema = json!({
            "$ref": "#/$defs/Node",
            "$defs": {
                "Node": {
                    "type": "object",
                    "properties": { "next": { "$ref": "#/$defs/Node" } }
                }
            }
        });
        let shape = Shape::from_json_schema(&schema);
        assert!(matches!(shape, Shape::Object { .. }));
    }
}
