//! Parameter validation contract attached to every registered tool.

use jsonschema::JSONSchema;
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Invalid parameter schema: {0}")]
pub struct SchemaError(String);

enum Validator {
    Compiled(JSONSchema),
    AnyObject,
    NoParams,
}

/// A compiled JSON Schema describing a tool's parameter object.
pub struct ParamSchema {
    raw: Map<String, Value>,
    validator: Validator,
}

impl ParamSchema {
    /// Compile a schema. The root must be an object schema.
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let raw = match schema {
            Value::Object(map) => map,
            other => return Err(SchemaError(format!("schema root must be an object, got {}", other))),
        };
        if let Some(ty) = raw.get("type") {
            if ty != "object" {
                return Err(SchemaError(format!(
                    "parameter schema must have type \"object\", got {}",
                    ty
                )));
            }
        }
        let compiled = JSONSchema::options()
            .compile(&Value::Object(raw.clone()))
            .map_err(|e| SchemaError(e.to_string()))?;
        Ok(Self {
            raw,
            validator: Validator::Compiled(compiled),
        })
    }

    /// Schema accepting any object.
    pub fn any_object() -> Self {
        Self {
            raw: object_schema(true),
            validator: Validator::AnyObject,
        }
    }

    /// Schema for tools that take no parameters.
    pub fn no_params() -> Self {
        Self {
            raw: object_schema(false),
            validator: Validator::NoParams,
        }
    }

    /// Validate caller parameters, returning every violation.
    pub fn validate(&self, params: &Value) -> Result<(), Vec<String>> {
        let Some(object) = params.as_object() else {
            return Err(vec!["parameters must be a JSON object".to_string()]);
        };
        match &self.validator {
            Validator::AnyObject => Ok(()),
            Validator::NoParams if object.is_empty() => Ok(()),
            Validator::NoParams => Err(object
                .keys()
                .map(|k| format!("unexpected parameter '{}'", k))
                .collect()),
            Validator::Compiled(compiled) => compiled.validate(params).map_err(|errors| {
                errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{}: {}", path, e)
                        }
                    })
                    .collect()
            }),
        }
    }

    pub fn as_json_object(&self) -> &Map<String, Value> {
        &self.raw
    }
}

fn object_schema(additional_properties: bool) -> Map<String, Value> {
    let mut raw = Map::new();
    raw.insert("type".to_string(), json!("object"));
    raw.insert("properties".to_string(), json!({}));
    raw.insert(
        "additionalProperties".to_string(),
        json!(additional_properties),
    );
    raw
}

impl fmt::Debug for ParamSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSchema").field("schema", &self.raw).finish()
    }
}
