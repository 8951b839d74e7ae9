//! Typed argument schemas.
//!
//! Tools declare their parameters in a JSON-Schema subset (the same shape
//! LLM function calling uses). The schema is parsed once, at registration,
//! so malformed declarations are rejected before any plan can name the tool.

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::FieldError;

/// JSON type accepted for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// No `type` declared
    Any,
}

impl ArgKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
}

/// Parsed argument schema of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArgumentSchema {
    fields: Vec<FieldSpec>,
    allow_additional: bool,
}

/// Why a declared schema was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema must be an object with \"type\": \"object\"")]
    NotAnObject,

    #[error("field '{field}' has unsupported type '{ty}'")]
    UnsupportedType { field: String, ty: String },

    #[error("field '{0}' is required but not declared in properties")]
    RequiredNotDeclared(String),

    #[error("\"required\" must be an array of strings")]
    InvalidRequired,

    #[error("default for field '{0}' does not match its type")]
    InvalidDefault(String),
}

impl ArgumentSchema {
    /// A schema that accepts any object.
    pub fn any() -> Self {
        Self {
            fields: Vec::new(),
            allow_additional: true,
        }
    }

    /// Parse a JSON-Schema object declaration.
    pub fn from_json(schema: &Value) -> Result<Self, SchemaError> {
        let obj = schema.as_object().ok_or(SchemaError::NotAnObject)?;
        match obj.get("type") {
            Some(Value::String(t)) if t == "object" => {}
            None => {}
            _ => return Err(SchemaError::NotAnObject),
        }

        let empty = Map::new();
        let properties = match obj.get("properties") {
            Some(Value::Object(p)) => p,
            Some(_) => return Err(SchemaError::NotAnObject),
            None => &empty,
        };

        let required: Vec<String> = match obj.get("required") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or(SchemaError::InvalidRequired)?,
            Some(_) => return Err(SchemaError::InvalidRequired),
        };

        for name in &required {
            if !properties.contains_key(name) {
                return Err(SchemaError::RequiredNotDeclared(name.clone()));
            }
        }

        let mut fields = Vec::with_capacity(properties.len());
        for (name, prop) in properties {
            let kind = match prop.get("type") {
                None => ArgKind::Any,
                Some(Value::String(t)) => {
                    ArgKind::parse(t).ok_or_else(|| SchemaError::UnsupportedType {
                        field: name.clone(),
                        ty: t.clone(),
                    })?
                }
                Some(other) => {
                    return Err(SchemaError::UnsupportedType {
                        field: name.clone(),
                        ty: other.to_string(),
                    })
                }
            };

            let default = prop.get("default").cloned();
            if let Some(d) = &default {
                if !kind.matches(d) {
                    return Err(SchemaError::InvalidDefault(name.clone()));
                }
            }

            fields.push(FieldSpec {
                name: name.clone(),
                kind,
                required: required.contains(name),
                default,
                allowed: prop.get("enum").and_then(Value::as_array).cloned(),
            });
        }

        let allow_additional = obj
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Ok(Self {
            fields,
            allow_additional,
        })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
    }

    /// Check `args` and return them normalized (defaults filled in).
    ///
    /// `null` is accepted as an empty object, and a `null` field counts as
    /// absent. Every offending field is reported, not just the first.
    pub fn validate(&self, args: &Value) -> Result<Value, Vec<FieldError>> {
        self.check(args, |_| false)
    }

    /// Plan-time check: like [`validate`](Self::validate), but a top-level
    /// field bound to an upstream result only has to be present.
    pub fn validate_plan(&self, args: &Value) -> Result<(), Vec<FieldError>> {
        self.check(args, crate::bindings::is_binding).map(|_| ())
    }

    fn check<F>(&self, args: &Value, deferred: F) -> Result<Value, Vec<FieldError>>
    where
        F: Fn(&Value) -> bool,
    {
        let mut normalized = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(vec![FieldError::new(
                    "$",
                    format!("arguments must be an object, got {}", type_name(other)),
                )])
            }
        };

        normalized.retain(|key, value| {
            !(value.is_null() && self.fields.iter().any(|f| &f.name == key))
        });

        let mut errors = Vec::new();

        for field in &self.fields {
            match normalized.get(&field.name) {
                Some(value) if deferred(value) => {}
                Some(value) => {
                    if !field.kind.matches(value) {
                        errors.push(FieldError::new(
                            &field.name,
                            format!("expected {}, got {}", field.kind.as_str(), type_name(value)),
                        ));
                    } else if let Some(allowed) = &field.allowed {
                        if !allowed.contains(value) {
                            errors.push(FieldError::new(
                                &field.name,
                                format!("value {} is not one of the allowed values", value),
                            ));
                        }
                    }
                }
                None if field.required => {
                    errors.push(FieldError::new(&field.name, "is required"));
                }
                None => {
                    if let Some(default) = &field.default {
                        normalized.insert(field.name.clone(), default.clone());
                    }
                }
            }
        }

        if !self.allow_additional {
            for key in normalized.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    errors.push(FieldError::new(key, "unexpected field"));
                }
            }
        }

        if errors.is_empty() {
            Ok(Value::Object(normalized))
        } else {
            Err(errors)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_file_schema() -> ArgumentSchema {
        ArgumentSchema::from_json(&json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "max_lines": {"type": "integer", "default": 200},
                "mode": {"type": "string", "enum": ["text", "lines"]}
            },
            "required": ["path"],
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_are_filled() {
        let args = read_file_schema().validate(&json!({"path": "a.txt"})).unwrap();
        assert_eq!(args, json!({"path": "a.txt", "max_lines": 200}));
    }

    #[test]
    fn test_all_field_errors_reported() {
        let errors = read_file_schema()
            .validate(&json!({"max_lines": "ten", "mode": "binary", "extra": 1}))
            .unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"path"));
        assert!(fields.contains(&"max_lines"));
        assert!(fields.contains(&"mode"));
        assert!(fields.contains(&"extra"));
    }

    #[test]
    fn test_null_args_treated_as_empty_object() {
        let schema = ArgumentSchema::from_json(&json!({"type": "object"})).unwrap();
        assert_eq!(schema.validate(&Value::Null).unwrap(), json!({}));
        assert!(schema.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_malformed_schemas_rejected() {
        assert_eq!(
            ArgumentSchema::from_json(&json!({"type": "string"})),
            Err(SchemaError::NotAnObject)
        );
        assert_eq!(
            ArgumentSchema::from_json(&json!({"properties": {}, "required": ["q"]})),
            Err(SchemaError::RequiredNotDeclared("q".to_string()))
        );
        assert!(matches!(
            ArgumentSchema::from_json(&json!({"properties": {"q": {"type": "blob"}}})),
            Err(SchemaError::UnsupportedType { .. })
        ));
        assert_eq!(
            ArgumentSchema::from_json(&json!({"properties": {"n": {"type": "integer", "default": "x"}}})),
            Err(SchemaError::InvalidDefault("n".to_string()))
        );
    }

    #[test]
    fn test_null_field_counts_as_absent() {
        let schema = read_file_schema();
        assert_eq!(
            schema.validate(&json!({"path": "a", "max_lines": null})).unwrap(),
            json!({"path": "a", "max_lines": 200})
        );
        assert!(schema.validate(&json!({"path": null})).is_err());
    }

    #[test]
    fn test_plan_check_defers_bound_fields() {
        let schema = read_file_schema();
        let args = json!({"path": {"$from": "t1", "pointer": "/entries/0/path"}});
        assert!(schema.validate_plan(&args).is_ok());
        assert!(schema.validate(&args).is_err());
        assert!(schema.validate_plan(&json!({})).is_err());
    }

    #[test]
    fn test_integer_vs_number() {
        let schema = ArgumentSchema::from_json(&json!({
            "properties": {"n": {"type": "integer"}, "x": {"type": "number"}}
        }))
        .unwrap();
        assert!(schema.validate(&json!({"n": 1, "x": 1})).is_ok());
        assert!(schema.validate(&json!({"n": 1.5})).is_err());
    }
}
