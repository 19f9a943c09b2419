//! KL-009: Declarative extension configuration schema.
//!
//! Validates and normalizes the raw YAML block handed to an extension's
//! `register`: fills defaults, checks types, bounds and choices, and rejects
//! unknown keys.

use super::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration block did not satisfy its schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("'{path}' is required")]
    Missing { path: String },

    #[error("'{path}' must be a {expected}, found {found}")]
    WrongType {
        path: String,
        expected: FieldType,
        found: &'static str,
    },

    #[error("'{path}' must be >= {min}, got {got}")]
    BelowMin { path: String, min: i64, got: i64 },

    #[error("'{path}' must be <= {max}, got {got}")]
    AboveMax { path: String, max: i64, got: i64 },

    #[error("'{path}' must be one of [{}], got '{got}'", .choices.join(", "))]
    NotAChoice {
        path: String,
        choices: Vec<String>,
        got: String,
    },

    #[error("unknown key '{path}'")]
    UnknownKey { path: String },

    #[error("configuration must be a map, found {found}")]
    NotAMap { found: &'static str },
}

/// Accepted value shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Bool,
    List,
    Map,
    Any,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// One configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub choices: Vec<String>,
    /// Shape of a `map` field; free-form when absent.
    #[serde(default)]
    pub fields: Option<ConfigSchema>,
}

impl Field {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            description: None,
            required: false,
            default: None,
            min: None,
            max: None,
            choices: Vec::new(),
            fields: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn int() -> Self {
        Self::new(FieldType::Int)
    }

    pub fn bool() -> Self {
        Self::new(FieldType::Bool)
    }

    pub fn list() -> Self {
        Self::new(FieldType::List)
    }

    pub fn map() -> Self {
        Self::new(FieldType::Map)
    }

    pub fn any() -> Self {
        Self::new(FieldType::Any)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn fields(mut self, schema: ConfigSchema) -> Self {
        self.field_type = FieldType::Map;
        self.fields = Some(schema);
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// Ordered set of fields for one configuration block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub fields: IndexMap<String, Field>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Validate `raw` and return it with defaults filled in. `Null` is
    /// treated as an empty block.
    pub fn normalize(&self, raw: &Value) -> Result<Value, SchemaError> {
        self.normalize_at("", raw)
    }

    fn normalize_at(&self, prefix: &str, raw: &Value) -> Result<Value, SchemaError> {
        let empty = IndexMap::new();
        let given = match raw {
            Value::Null => &empty,
            Value::Map(map) => map,
            other => {
                return Err(SchemaError::NotAMap {
                    found: other.kind(),
                })
            }
        };

        if let Some(key) = given.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(SchemaError::UnknownKey {
                path: join(prefix, key),
            });
        }

        let mut out = IndexMap::with_capacity(self.fields.len());
        for (name, field) in &self.fields {
            let path = join(prefix, name);
            let value = match given.get(name).or(field.default.as_ref()) {
                Some(v) => v,
                None if field.required => return Err(SchemaError::Missing { path }),
                None => continue,
            };
            out.insert(name.clone(), check_field(&path, field, value)?);
        }
        Ok(Value::Map(out))
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn check_field(path: &str, field: &Field, value: &Value) -> Result<Value, SchemaError> {
    let wrong = || SchemaError::WrongType {
        path: path.to_string(),
        expected: field.field_type,
        found: value.kind(),
    };
    match field.field_type {
        FieldType::Any => Ok(value.clone()),
        FieldType::String => {
            let s = value.as_str().ok_or_else(wrong)?;
            if !field.choices.is_empty() && !field.choices.iter().any(|c| c == s) {
                return Err(SchemaError::NotAChoice {
                    path: path.to_string(),
                    choices: field.choices.clone(),
                    got: s.to_string(),
                });
            }
            Ok(value.clone())
        }
        FieldType::Int => {
            let n = value.as_i64().ok_or_else(wrong)?;
            if let Some(min) = field.min {
                if n < min {
                    return Err(SchemaError::BelowMin {
                        path: path.to_string(),
                        min,
                        got: n,
                    });
                }
            }
            if let Some(max) = field.max {
                if n > max {
                    return Err(SchemaError::AboveMax {
                        path: path.to_string(),
                        max,
                        got: n,
                    });
                }
            }
            Ok(value.clone())
        }
        FieldType::Bool => value.as_bool().map(Value::Bool).ok_or_else(wrong),
        FieldType::List => value.as_list().map(|_| value.clone()).ok_or_else(wrong),
        FieldType::Map => match &field.fields {
            Some(schema) if matches!(value, Value::Map(_) | Value::Null) => {
                schema.normalize_at(path, value)
            }
            _ => value.as_map().map(|_| value.clone()).ok_or_else(wrong),
        },
    }
}
