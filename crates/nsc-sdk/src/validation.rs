//! JSON-schema checks for request and response payloads.
//!
//! [`BasicValidator`] covers the subset of JSON Schema that method
//! declarations use: `type`, `required`, `properties`,
//! `additionalProperties`, `items`, `enum`, `minimum`/`maximum`,
//! `minLength`/`maxLength` and local `$ref` pointers.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct ValidationError {
    /// JSON pointer to the offending value; empty for the root.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "/".into() } else { path.into() },
            message: message.into(),
        }
    }
}

pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, instance: &Value) -> Result<(), ValidationError>;
}

/// Validator with an optional root document for resolving `$ref`.
#[derive(Debug, Clone, Default)]
pub struct BasicValidator {
    root: Option<Value>,
}

impl BasicValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `$ref: "#/..."` against `root` instead of the schema being checked.
    pub fn with_root(root: Value) -> Self {
        Self { root: Some(root) }
    }

    fn check(
        &self,
        schema: &Value,
        doc: &Value,
        instance: &Value,
        path: &str,
        depth: usize,
    ) -> Result<(), ValidationError> {
        if depth > 32 {
            return Err(ValidationError::new(path, "schema reference depth exceeded"));
        }
        let schema = match schema {
            Value::Bool(true) => return Ok(()),
            Value::Bool(false) => return Err(ValidationError::new(path, "no value is allowed")),
            Value::Object(schema) => schema,
            _ => return Ok(()),
        };

        if let Some(Value::String(reference)) = schema.get("$ref") {
            let target = self.resolve(doc, reference).ok_or_else(|| {
                ValidationError::new(path, format!("unresolvable reference {reference}"))
            })?;
            self.check(target, doc, instance, path, depth + 1)?;
        }

        if let Some(expected) = schema.get("type") {
            check_type(expected, instance, path)?;
        }

        if let Some(Value::Array(options)) = schema.get("enum") {
            if !options.contains(instance) {
                return Err(ValidationError::new(path, "value is not one of the allowed options"));
            }
        }

        if let Some(number) = instance.as_f64() {
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if number < min {
                    return Err(ValidationError::new(path, format!("{number} is below {min}")));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if number > max {
                    return Err(ValidationError::new(path, format!("{number} is above {max}")));
                }
            }
        }

        if let Some(text) = instance.as_str() {
            let len = text.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    return Err(ValidationError::new(path, format!("shorter than {min}")));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    return Err(ValidationError::new(path, format!("longer than {max}")));
                }
            }
        }

        match instance {
            Value::Object(object) => self.check_object(schema, doc, object, path, depth),
            Value::Array(items) => {
                if let Some(item_schema) = schema.get("items") {
                    for (i, item) in items.iter().enumerate() {
                        self.check(item_schema, doc, item, &format!("{path}/{i}"), depth + 1)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_object(
        &self,
        schema: &Map<String, Value>,
        doc: &Value,
        object: &Map<String, Value>,
        path: &str,
        depth: usize,
    ) -> Result<(), ValidationError> {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(ValidationError::new(
                        path,
                        format!("missing required property {name}"),
                    ));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (name, value) in object {
            let child = format!("{path}/{name}");
            match properties.and_then(|p| p.get(name)) {
                Some(property) => self.check(property, doc, value, &child, depth + 1)?,
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        return Err(ValidationError::new(
                            path,
                            format!("unexpected property {name}"),
                        ))
                    }
                    Some(extra @ Value::Object(_)) => {
                        self.check(extra, doc, value, &child, depth + 1)?
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }

    fn resolve<'a>(&'a self, doc: &'a Value, reference: &str) -> Option<&'a Value> {
        let pointer = reference.strip_prefix('#')?;
        self.root
            .as_ref()
            .and_then(|root| root.pointer(pointer))
            .or_else(|| doc.pointer(pointer))
    }
}

impl SchemaValidator for BasicValidator {
    fn validate(&self, schema: &Value, instance: &Value) -> Result<(), ValidationError> {
        self.check(schema, schema, instance, "", 0)
    }
}

fn check_type(expected: &Value, instance: &Value, path: &str) -> Result<(), ValidationError> {
    let matches = |name: &str| match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        "integer" => instance.is_i64() || instance.is_u64(),
        _ => true,
    };
    let ok = match expected {
        Value::String(name) => matches(name),
        Value::Array(names) => names.iter().filter_map(Value::as_str).any(matches),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::new(path, format!("expected type {expected}")))
    }
}
