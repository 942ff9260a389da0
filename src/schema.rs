//! Structural schemas for cached JSON payloads

use std::collections::BTreeMap;

use serde_json::Value;

/// Expected shape of a cached value
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    Array(Box<Schema>),
    Object {
        fields: BTreeMap<String, Schema>,
        /// Accept fields not listed in `fields`
        allow_unknown: bool,
    },
    /// Value may be null or absent
    Optional(Box<Schema>),
}

/// First mismatch found while validating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON path of the mismatch, `$` is the root
    pub path: String,
    pub reason: String,
}

impl Schema {
    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }

    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    /// Closed object: unknown fields are rejected
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Schema::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            allow_unknown: false,
        }
    }

    /// Open object: unknown fields are accepted
    pub fn open_object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Schema::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            allow_unknown: true,
        }
    }

    /// Check `value` against this schema
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.check(value, "$")
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        match (self, value) {
            (Schema::Any, _) => Ok(()),
            (Schema::Optional(_), Value::Null) => Ok(()),
            (Schema::Optional(inner), v) => inner.check(v, path),
            (Schema::Null, Value::Null) => Ok(()),
            (Schema::Bool, Value::Bool(_)) => Ok(()),
            (Schema::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (Schema::Number, Value::Number(_)) => Ok(()),
            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::Array(item), Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    item.check(v, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            (
                Schema::Object {
                    fields,
                    allow_unknown,
                },
                Value::Object(map),
            ) => {
                for (name, field) in fields {
                    let field_path = format!("{path}.{name}");
                    match map.get(name) {
                        Some(v) => field.check(v, &field_path)?,
                        None if matches!(field, Schema::Optional(_) | Schema::Any) => {}
                        None => return Err(violation(field_path, "missing required field")),
                    }
                }
                if !allow_unknown
                    && let Some(extra) = map.keys().find(|k| !fields.contains_key(*k))
                {
                    return Err(violation(format!("{path}.{extra}"), "unexpected field"));
                }
                Ok(())
            }
            (expected, actual) => Err(violation(
                path.to_owned(),
                format!("expected {}, found {}", expected.name(), kind(actual)),
            )),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Schema::Any => "any",
            Schema::Null => "null",
            Schema::Bool => "bool",
            Schema::Integer => "integer",
            Schema::Number => "number",
            Schema::String => "string",
            Schema::Array(_) => "array",
            Schema::Object { .. } => "object",
            Schema::Optional(inner) => inner.name(),
        }
    }
}

fn violation(path: String, reason: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path,
        reason: reason.into(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
