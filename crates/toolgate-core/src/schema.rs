//! Declarative input schemas for tool arguments.
//!
//! Tools describe their arguments with a small tagged representation instead
//! of raw JSON Schema documents: the gateway needs to *parse* arguments
//! (apply defaults, check constraints) before policy evaluation, and it needs
//! to *emit* a JSON-Schema-shaped object for discovery. Both come from the
//! same definition so they cannot drift.

use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Validation failure for a single field, addressed by its path
/// (`headers.accept`, `tags[2]`).
#[derive(Debug, Clone, Error)]
#[error("{path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The type (and constraints) of one argument field.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Accepts any JSON value. Used where the gateway deliberately passes
    /// values through untyped (e.g. positional query parameters).
    Any,
    String {
        min_len: Option<usize>,
        max_len: Option<usize>,
        pattern: Option<Regex>,
    },
    Number {
        min: Option<f64>,
        max: Option<f64>,
        integer: bool,
    },
    Boolean,
    Enum {
        options: Vec<String>,
    },
    Array {
        items: Box<FieldType>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object {
        schema: Box<InputSchema>,
    },
}

impl FieldType {
    pub fn any() -> Self {
        FieldType::Any
    }

    pub fn string() -> Self {
        FieldType::String {
            min_len: None,
            max_len: None,
            pattern: None,
        }
    }

    pub fn string_len(min_len: Option<usize>, max_len: Option<usize>) -> Self {
        FieldType::String {
            min_len,
            max_len,
            pattern: None,
        }
    }

    pub fn string_matching(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FieldType::String {
            min_len: None,
            max_len: None,
            pattern: Some(Regex::new(pattern)?),
        })
    }

    pub fn number() -> Self {
        FieldType::Number {
            min: None,
            max: None,
            integer: false,
        }
    }

    pub fn integer() -> Self {
        FieldType::Number {
            min: None,
            max: None,
            integer: true,
        }
    }

    pub fn integer_range(min: i64, max: i64) -> Self {
        FieldType::Number {
            min: Some(min as f64),
            max: Some(max as f64),
            integer: true,
        }
    }

    pub fn boolean() -> Self {
        FieldType::Boolean
    }

    pub fn enumeration<S: AsRef<str>>(options: &[S]) -> Self {
        FieldType::Enum {
            options: options.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    pub fn array_of(items: FieldType) -> Self {
        FieldType::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
        }
    }

    pub fn object(schema: InputSchema) -> Self {
        FieldType::Object {
            schema: Box::new(schema),
        }
    }

    fn check(&self, path: &str, value: &Value) -> Result<(), SchemaError> {
        match self {
            FieldType::Any => Ok(()),
            FieldType::String {
                min_len,
                max_len,
                pattern,
            } => {
                let Some(s) = value.as_str() else {
                    return Err(SchemaError::new(path, "expected a string"));
                };
                let chars = s.chars().count();
                if let Some(min) = min_len
                    && chars < *min
                {
                    return Err(SchemaError::new(
                        path,
                        format!("must be at least {min} characters"),
                    ));
                }
                if let Some(max) = max_len
                    && chars > *max
                {
                    return Err(SchemaError::new(
                        path,
                        format!("must be at most {max} characters"),
                    ));
                }
                if let Some(re) = pattern
                    && !re.is_match(s)
                {
                    return Err(SchemaError::new(
                        path,
                        format!("must match pattern {}", re.as_str()),
                    ));
                }
                Ok(())
            }
            FieldType::Number { min, max, integer } => {
                let Some(n) = value.as_f64() else {
                    return Err(SchemaError::new(path, "expected a number"));
                };
                if *integer && !(value.is_i64() || value.is_u64()) {
                    return Err(SchemaError::new(path, "expected an integer"));
                }
                if let Some(min) = min
                    && n < *min
                {
                    return Err(SchemaError::new(path, format!("must be >= {min}")));
                }
                if let Some(max) = max
                    && n > *max
                {
                    return Err(SchemaError::new(path, format!("must be <= {max}")));
                }
                Ok(())
            }
            FieldType::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(SchemaError::new(path, "expected a boolean"))
                }
            }
            FieldType::Enum { options } => {
                let Some(s) = value.as_str() else {
                    return Err(SchemaError::new(path, "expected a string"));
                };
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(SchemaError::new(
                        path,
                        format!("must be one of: {}", options.join(", ")),
                    ))
                }
            }
            FieldType::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(arr) = value.as_array() else {
                    return Err(SchemaError::new(path, "expected an array"));
                };
                if let Some(min) = min_items
                    && arr.len() < *min
                {
                    return Err(SchemaError::new(
                        path,
                        format!("must have at least {min} items"),
                    ));
                }
                if let Some(max) = max_items
                    && arr.len() > *max
                {
                    return Err(SchemaError::new(
                        path,
                        format!("must have at most {max} items"),
                    ));
                }
                for (i, item) in arr.iter().enumerate() {
                    items.check(&format!("{path}[{i}]"), item)?;
                }
                Ok(())
            }
            FieldType::Object { schema } => {
                let Some(map) = value.as_object() else {
                    return Err(SchemaError::new(path, "expected an object"));
                };
                schema.check_at(path, map)?;
                Ok(())
            }
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            FieldType::Any => json!({}),
            FieldType::String {
                min_len,
                max_len,
                pattern,
            } => {
                let mut v = json!({"type": "string"});
                if let Some(min) = min_len {
                    v["minLength"] = json!(min);
                }
                if let Some(max) = max_len {
                    v["maxLength"] = json!(max);
                }
                if let Some(re) = pattern {
                    v["pattern"] = json!(re.as_str());
                }
                v
            }
            FieldType::Number { min, max, integer } => {
                let mut v = if *integer {
                    json!({"type": "integer"})
                } else {
                    json!({"type": "number"})
                };
                if let Some(min) = min {
                    v["minimum"] = json!(min);
                }
                if let Some(max) = max {
                    v["maximum"] = json!(max);
                }
                v
            }
            FieldType::Boolean => json!({"type": "boolean"}),
            FieldType::Enum { options } => json!({"type": "string", "enum": options}),
            FieldType::Array {
                items,
                min_items,
                max_items,
            } => {
                let mut v = json!({"type": "array", "items": items.json_schema()});
                if let Some(min) = min_items {
                    v["minItems"] = json!(min);
                }
                if let Some(max) = max_items {
                    v["maxItems"] = json!(max);
                }
                v
            }
            FieldType::Object { schema } => schema.to_json_schema(),
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    ty: FieldType,
    description: String,
    required: bool,
    default: Option<Value>,
}

/// An ordered set of named argument fields.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    fields: Vec<Field>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            ty,
            description: description.to_string(),
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            ty,
            description: description.to_string(),
            required: false,
            default: None,
        });
        self
    }

    pub fn with_default(
        mut self,
        name: &str,
        ty: FieldType,
        description: &str,
        default: Value,
    ) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            ty,
            description: description.to_string(),
            required: false,
            default: Some(default),
        });
        self
    }

    /// Validate `raw` and return the effective arguments: declared fields are
    /// type-checked, absent fields with defaults are filled in, and keys the
    /// schema does not mention pass through untouched (the policy layer is
    /// responsible for rejecting unexpected keys).
    pub fn parse(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        let mut out = raw.clone();
        self.apply(&mut out, "")?;
        Ok(out)
    }

    fn apply(&self, out: &mut Map<String, Value>, prefix: &str) -> Result<(), SchemaError> {
        for field in &self.fields {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix}.{}", field.name)
            };
            match out.get(&field.name) {
                Some(value) => field.ty.check(&path, value)?,
                None => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(SchemaError::new(path, "missing required field"));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_at(&self, prefix: &str, map: &Map<String, Value>) -> Result<(), SchemaError> {
        // Nested objects are validated in place; defaults are only applied at
        // the top level where the harness owns the argument map.
        for field in &self.fields {
            let path = format!("{prefix}.{}", field.name);
            match map.get(&field.name) {
                Some(value) => field.ty.check(&path, value)?,
                None => {
                    if field.required && field.default.is_none() {
                        return Err(SchemaError::new(path, "missing required field"));
                    }
                }
            }
        }
        Ok(())
    }

    /// JSON-Schema-shaped description for discovery. Fields with defaults are
    /// not listed as required.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut schema = field.ty.json_schema();
            if !field.description.is_empty() {
                schema["description"] = json!(field.description);
            }
            if let Some(default) = &field.default {
                schema["default"] = default.clone();
            }
            properties.insert(field.name.clone(), schema);
            if field.required && field.default.is_none() {
                required.push(field.name.clone());
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
